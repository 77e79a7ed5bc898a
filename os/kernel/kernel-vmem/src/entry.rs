//! # x86-64 Page-Table Entry Codec
//!
//! One entry type serves every level. Non-leaf entries hold a 4 KiB-aligned
//! pointer to the next table; leaf entries hold the mapped physical base and
//! set `PS` when they terminate the walk above the 4 KiB level.
//!
//! ## Invariants & Notes
//!
//! - [`PageEntry::leaf`] masks the physical base to the granularity of its
//!   [`PageKind`]; [`PageEntry::table`] masks to 4 KiB.
//! - Protection is the **pair** of the writable and no-execute bits; see
//!   [`Protect`]. [`PageEntry::with_protect`] rewrites exactly those two bits
//!   and nothing else, which is what the allocator's `protect` walk relies on.
//! - Raw accessors do not validate consistency; the allocators only write
//!   entries built by the typed constructors.
//! - After modifying active mappings, the caller must perform any required
//!   TLB maintenance.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Physical-address window of a non-leaf entry and of a 4 KiB leaf
/// (bits 51:12).
const ADDR_MASK_4K: u64 = 0x000F_FFFF_FFFF_F000;
/// Physical-address window of a 2 MiB leaf (bits 51:21).
const ADDR_MASK_2M: u64 = 0x000F_FFFF_FFE0_0000;
/// Physical-address window of a 1 GiB leaf (bits 51:30).
const ADDR_MASK_1G: u64 = 0x000F_FFFF_C000_0000;

/// An architectural page-table entry (any level).
///
/// - Bit 7 (`page_size`) selects a 2 MiB / 1 GiB leaf in a PDE / PDPTE; it
///   must be 0 in a PTE and a PML4E.
/// - Bits 51:12 carry the physical base; wider leaves simply leave the low
///   part of the window zero.
#[bitfield(u64)]
pub struct PageEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User-accessible (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5): set by the CPU on first access.
    pub accessed: bool,
    /// Dirty (bit 6): set by the CPU on first write (leaf only).
    pub dirty: bool,
    /// Page Size (bit 7): this entry is a 2 MiB / 1 GiB leaf.
    pub page_size: bool,
    /// Global (bit 8): TLB entry survives CR3 reloads.
    pub global: bool,
    /// OS-available low (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical address bits 51:12.
    #[bits(40)]
    phys_addr_51_12: u64,
    /// OS-available high (bits 52..58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection Key / OS use (bits 59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

impl PageEntry {
    /// The non-present, all-zero entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Build a **present leaf** mapping `base` with granularity `kind` and
    /// protection `protect`.
    ///
    /// `base` is masked to the granularity's address window; `PS` is set for
    /// 2 MiB and 1 GiB leaves.
    #[must_use]
    pub const fn leaf(base: PhysicalAddress, kind: PageKind, protect: Protect) -> Self {
        let bits = (base.as_u64() & kind.addr_mask())
            | match kind {
                PageKind::Page4K => 0,
                PageKind::Page2M | PageKind::Page1G => 1 << 7,
            };
        Self::from_bits(bits)
            .with_present(true)
            .with_writable(protect.writable())
            .with_no_execute(protect.no_execute())
    }

    /// Build a **reserved leaf**: protection and `PS` as for [`leaf`](Self::leaf),
    /// but no base and not present. The allocator parks reserved slots in
    /// this form and commits them later by patching in the base address.
    #[must_use]
    pub const fn reserved_leaf(kind: PageKind, protect: Protect) -> Self {
        Self::leaf(PhysicalAddress::zero(), kind, protect).with_present(false)
    }

    /// Build a **non-leaf** entry pointing at the table page `table`.
    ///
    /// Present and writable; finer permissions live in the leaves.
    #[must_use]
    pub const fn table(table: PhysicalAddress) -> Self {
        Self::from_bits(table.as_u64() & ADDR_MASK_4K)
            .with_present(true)
            .with_writable(true)
    }

    /// The physical base mapped by this entry, read at granularity `kind`.
    #[inline]
    #[must_use]
    pub const fn leaf_base(self, kind: PageKind) -> PhysicalAddress {
        PhysicalAddress::new(self.into_bits() & kind.addr_mask())
    }

    /// Replace the physical base, keeping every other bit.
    #[inline]
    #[must_use]
    pub const fn with_leaf_base(self, kind: PageKind, base: PhysicalAddress) -> Self {
        let bits = self.into_bits() & !kind.addr_mask();
        Self::from_bits(bits | (base.as_u64() & kind.addr_mask()))
    }

    /// The child table referenced by this non-leaf entry.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> PhysicalAddress {
        PhysicalAddress::new(self.into_bits() & ADDR_MASK_4K)
    }

    /// The protection set encoded in the writable / no-execute pair.
    #[inline]
    #[must_use]
    pub const fn protect(self) -> Protect {
        Protect::from_parts(self.writable(), self.no_execute())
    }

    /// Rewrite the protection bits (writable + no-execute) **only**; the
    /// base address, presence, and every other bit are preserved.
    #[inline]
    #[must_use]
    pub const fn with_protect(self, protect: Protect) -> Self {
        self.with_writable(protect.writable())
            .with_no_execute(protect.no_execute())
    }
}

/// The four protection sets the allocators expose.
///
/// The discriminants are the wire values of the protect nibble in the
/// allocation flag word.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Protect {
    /// Read + write, no execute.
    #[default]
    ReadWrite = 0,
    /// Read only, no execute.
    ReadOnly = 1,
    /// Read + write + execute.
    ReadWriteExecute = 2,
    /// Read + execute.
    ReadExecute = 3,
}

impl Protect {
    /// Whether the writable bit is set for this protection.
    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadWriteExecute)
    }

    /// Whether the no-execute bit is set for this protection.
    #[inline]
    #[must_use]
    pub const fn no_execute(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadOnly)
    }

    /// Recover the protection from the (writable, no-execute) bit pair.
    #[inline]
    #[must_use]
    pub const fn from_parts(writable: bool, no_execute: bool) -> Self {
        match (writable, no_execute) {
            (true, true) => Self::ReadWrite,
            (false, true) => Self::ReadOnly,
            (true, false) => Self::ReadWriteExecute,
            (false, false) => Self::ReadExecute,
        }
    }

    #[inline]
    #[must_use]
    #[doc(hidden)]
    pub const fn from_bits(v: u8) -> Self {
        match v & 3 {
            0 => Self::ReadWrite,
            1 => Self::ReadOnly,
            2 => Self::ReadWriteExecute,
            _ => Self::ReadExecute,
        }
    }

    #[inline]
    #[must_use]
    #[doc(hidden)]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Leaf granularity: which level a mapping terminates at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// 4 KiB leaf in a PTE (level 0).
    Page4K,
    /// 2 MiB leaf in a PDE with `PS=1` (level 1).
    Page2M,
    /// 1 GiB leaf in a PDPTE with `PS=1` (level 2).
    Page1G,
}

impl PageKind {
    /// Physical-address window for this granularity.
    #[inline]
    #[must_use]
    pub const fn addr_mask(self) -> u64 {
        match self {
            Self::Page4K => ADDR_MASK_4K,
            Self::Page2M => ADDR_MASK_2M,
            Self::Page1G => ADDR_MASK_1G,
        }
    }

    /// The page-table level a leaf of this granularity lives on.
    #[inline]
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Page4K => 0,
            Self::Page2M => 1,
            Self::Page1G => 2,
        }
    }

    /// Number of 4 KiB frames covered by one leaf of this granularity.
    #[inline]
    #[must_use]
    pub const fn frames(self) -> u64 {
        1 << (9 * self.level())
    }

    /// The granularity whose leaves live on `level`, if any.
    #[inline]
    #[must_use]
    pub const fn for_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Page4K),
            1 => Some(Self::Page2M),
            2 => Some(Self::Page1G),
            _ => None,
        }
    }
}

/// A page table: 512 entries, 4 KiB-aligned. One type serves every level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; 512],
}

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::zero(); 512],
        }
    }

    /// Read the entry at `i`.
    ///
    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntry {
        self.entries[i]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active
    /// mappings.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntry) {
        self.entries[i] = e;
    }

    /// Set the entry at `i` to [`PageEntry::zero`].
    #[inline]
    pub const fn set_zero(&mut self, i: usize) {
        self.set(i, PageEntry::zero());
    }
}

/// Index into the level-`level` table for the 4 KiB page slot `page_index`.
///
/// `level` counts from the leaves: 0 is the PT, 3 is the PML4 (4 when LA57
/// adds a fifth level). Returns a value in `0..512`.
#[inline]
#[must_use]
pub const fn table_index(page_index: u64, level: u8) -> usize {
    ((page_index >> (9 * level)) & 0x1FF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_4k_bit_pattern() {
        let e = PageEntry::leaf(
            PhysicalAddress::new(0xA000),
            PageKind::Page4K,
            Protect::ReadWrite,
        );
        // present | writable | base | NX
        assert_eq!(e.into_bits(), 0x8000_0000_0000_A003);
        assert!(e.present());
        assert!(!e.page_size());
        assert_eq!(e.leaf_base(PageKind::Page4K).as_u64(), 0xA000);
    }

    #[test]
    fn leaf_2m_sets_ps_and_masks_base() {
        let e = PageEntry::leaf(
            PhysicalAddress::new(0x0040_0000 | 0x1234),
            PageKind::Page2M,
            Protect::ReadExecute,
        );
        assert!(e.page_size());
        assert!(!e.writable());
        assert!(!e.no_execute());
        // sub-2MiB bits of the base do not survive
        assert_eq!(e.leaf_base(PageKind::Page2M).as_u64(), 0x0040_0000);
    }

    #[test]
    fn leaf_1g_sets_ps() {
        let e = PageEntry::leaf(
            PhysicalAddress::new(0x4000_0000),
            PageKind::Page1G,
            Protect::ReadOnly,
        );
        assert!(e.page_size());
        assert!(!e.writable());
        assert!(e.no_execute());
        assert_eq!(e.leaf_base(PageKind::Page1G).as_u64(), 0x4000_0000);
    }

    #[test]
    fn table_pointer_round_trip() {
        let e = PageEntry::table(PhysicalAddress::new(0x7000));
        assert_eq!(e.into_bits() & 0xFFF, 0x3); // present | writable
        assert_eq!(e.next_table().as_u64(), 0x7000);
    }

    #[test]
    fn protect_rewrite_preserves_base() {
        let e = PageEntry::leaf(
            PhysicalAddress::new(0xC000),
            PageKind::Page4K,
            Protect::ReadWrite,
        );
        let e = e.with_protect(Protect::ReadExecute);
        assert_eq!(e.leaf_base(PageKind::Page4K).as_u64(), 0xC000);
        assert!(e.present());
        assert!(!e.writable());
        assert!(!e.no_execute());
        assert_eq!(e.protect(), Protect::ReadExecute);
    }

    #[test]
    fn protect_encodings() {
        for (p, w, nx) in [
            (Protect::ReadWrite, true, true),
            (Protect::ReadOnly, false, true),
            (Protect::ReadWriteExecute, true, false),
            (Protect::ReadExecute, false, false),
        ] {
            assert_eq!(p.writable(), w);
            assert_eq!(p.no_execute(), nx);
            assert_eq!(Protect::from_parts(w, nx), p);
            assert_eq!(Protect::from_bits(p.into_bits()), p);
        }
    }

    #[test]
    fn patch_base_keeps_flags() {
        let e = PageEntry::reserved_leaf(PageKind::Page4K, Protect::ReadOnly);
        assert!(!e.present());
        let e = e
            .with_leaf_base(PageKind::Page4K, PhysicalAddress::new(0x5000))
            .with_present(true);
        assert!(e.no_execute());
        assert!(!e.writable());
        assert_eq!(e.leaf_base(PageKind::Page4K).as_u64(), 0x5000);
    }

    #[test]
    fn index_extraction() {
        // page 0x8000 -> level 0 index 0, after shifting by 9 lands in level 1
        let page = 0x1FF + (3 << 9) + (7 << 18);
        assert_eq!(table_index(page, 0), 0x1FF);
        assert_eq!(table_index(page, 1), 3);
        assert_eq!(table_index(page, 2), 7);
        assert_eq!(table_index(page, 3), 0);
    }
}
