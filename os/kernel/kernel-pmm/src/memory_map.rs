//! # Boot Memory Map
//!
//! The model of the physical memory map the boot shim hands to the
//! allocator, the callback protocol it arrives through, and the validation
//! the allocator performs before trusting it.
//!
//! A broken map is unrecoverable this early, so [`validate`] feeds a
//! structured [`MemoryMapError`] to the init path, which panics on it
//! (and stays testable without panicking).

use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

/// Bytes reserved at the bottom of physical memory: the null-guard page
/// `[0, 0x1000)` and the trampoline pages `[0x1000, 0x3000)`.
pub const LOW_RESERVED: u64 = 0x3000;

/// The null-guard entry the allocator adds to its canonical map.
pub const NULL_GUARD_REGION: Region = Region {
    start: PhysicalAddress::zero(),
    size: 0x1000,
    kind: RegionKind::NullGuard,
};

/// The trampoline entry the allocator adds to its canonical map.
pub const TRAMPOLINE_REGION: Region = Region {
    start: PhysicalAddress::new(0x1000),
    size: 0x2000,
    kind: RegionKind::Trampoline,
};

/// Classification of a physical region.
///
/// Bit 0 signals "usable now": plain [`Usable`](Self::Usable) memory plus the
/// two reclaimable flavors that [`reclaim`](crate::FreeLutPmm::reclaim) later
/// converts into free frames.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Free RAM, handed to the allocator at init.
    Usable = 0x01,
    /// Boot-information structures, reclaimable after the kernel copied them.
    Reclaimable = 0x11,
    /// Loader code/data, reclaimable after the handoff completed.
    LoaderReclaimable = 0x21,
    /// RAM owned by the allocator's clients.
    Taken = 0x02,
    /// The unmapped page 0.
    NullGuard = 0x12,
    /// The low-memory trampoline used to boot application processors.
    Trampoline = 0x22,
    /// The kernel image.
    Kernel = 0x04,
    /// A boot module.
    Module = 0x14,
    /// The allocator's own footprint (state header, bitmap, canonical map).
    Pmm = 0x24,
    /// Firmware-reserved, never touched.
    Reserved = 0x08,
    /// ACPI tables.
    Acpi = 0x18,
    /// ACPI non-volatile storage.
    Nvs = 0x28,
}

impl RegionKind {
    /// Whether frames of this kind are (or will become) allocatable RAM.
    #[inline]
    #[must_use]
    pub const fn is_usable_now(self) -> bool {
        self as u32 & 1 != 0
    }

    /// Decode the wire value a boot protocol shim carries; `None` for
    /// anything that is not one of the defined kinds.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x01 => Self::Usable,
            0x11 => Self::Reclaimable,
            0x21 => Self::LoaderReclaimable,
            0x02 => Self::Taken,
            0x12 => Self::NullGuard,
            0x22 => Self::Trampoline,
            0x04 => Self::Kernel,
            0x14 => Self::Module,
            0x24 => Self::Pmm,
            0x08 => Self::Reserved,
            0x18 => Self::Acpi,
            0x28 => Self::Nvs,
            _ => return None,
        })
    }
}

/// One page-aligned region of physical memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// First byte (page-aligned).
    pub start: PhysicalAddress,
    /// Length in bytes (page-aligned, non-zero).
    pub size: u64,
    /// Classification.
    pub kind: RegionKind,
}

impl Region {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, size: u64, kind: RegionKind) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            size,
            kind,
        }
    }

    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.size)
    }

    /// Number of 4 KiB frames spanned.
    #[inline]
    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.size >> Size4K::SHIFT
    }
}

/// Callback protocol for the boot memory map.
///
/// The boot shim owns the raw firmware map in whatever shape the protocol
/// delivered it; the allocator only ever asks for entry `i`. A slice of
/// [`Region`]s implements this directly (used by tests and by shims that
/// already normalized their map).
pub trait MemoryMapSource {
    /// Number of entries.
    fn len(&self) -> usize;

    /// Entry `index`, or `None` when the source cannot produce it.
    fn entry(&self, index: usize) -> Option<Region>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemoryMapSource for [Region] {
    fn len(&self) -> usize {
        self.len()
    }

    fn entry(&self, index: usize) -> Option<Region> {
        self.get(index).copied()
    }
}

impl MemoryMapSource for &[Region] {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn entry(&self, index: usize) -> Option<Region> {
        self.get(index).copied()
    }
}

/// Why a boot memory map was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryMapError {
    /// The callback produced no entry at `index`.
    #[error("memory map callback produced no entry at index {0}")]
    Truncated(usize),
    /// Entry `index` has an unaligned start or size.
    #[error("memory map entry {0} is not page aligned")]
    Unaligned(usize),
    /// Entry `index` starts before the previous entry ended.
    #[error("memory map entry {0} is out of order or overlapping")]
    Unsorted(usize),
    /// The map's first entry does not declare the reserved low pages as
    /// plain usable RAM starting at physical zero.
    #[error("memory map must start with a usable region covering the low pages (entry {0})")]
    LowPagesReserved(usize),
}

/// Check the init invariants: sorted, page-aligned, non-overlapping, and
/// the first three pages **declared** free. The map's first entry must
/// start at physical zero, span at least the reserved pages, and be plain
/// usable RAM; a map that merely omits the low pages is rejected, since
/// nothing then accounts for the null guard and the trampoline.
///
/// # Errors
/// The first violated invariant, with the offending entry index.
pub fn validate(source: &dyn MemoryMapSource) -> Result<(), MemoryMapError> {
    if source.is_empty() {
        return Err(MemoryMapError::Truncated(0));
    }
    let mut cursor = 0u64;
    for i in 0..source.len() {
        let region = source.entry(i).ok_or(MemoryMapError::Truncated(i))?;
        if !region.start.is_aligned::<Size4K>() || region.size & (Size4K::SIZE - 1) != 0 {
            return Err(MemoryMapError::Unaligned(i));
        }
        if region.start.as_u64() < cursor {
            return Err(MemoryMapError::Unsorted(i));
        }
        if i == 0
            && (region.start.as_u64() != 0
                || region.size < LOW_RESERVED
                || region.kind != RegionKind::Usable)
        {
            return Err(MemoryMapError::LowPagesReserved(0));
        }
        cursor = region.end().as_u64();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_and_usable_bit() {
        for kind in [
            RegionKind::Usable,
            RegionKind::Reclaimable,
            RegionKind::LoaderReclaimable,
            RegionKind::Taken,
            RegionKind::NullGuard,
            RegionKind::Trampoline,
            RegionKind::Kernel,
            RegionKind::Module,
            RegionKind::Pmm,
            RegionKind::Reserved,
            RegionKind::Acpi,
            RegionKind::Nvs,
        ] {
            assert_eq!(RegionKind::from_raw(kind as u32), Some(kind));
        }
        assert!(RegionKind::Usable.is_usable_now());
        assert!(RegionKind::Reclaimable.is_usable_now());
        assert!(RegionKind::LoaderReclaimable.is_usable_now());
        assert!(!RegionKind::Taken.is_usable_now());
        assert!(!RegionKind::Kernel.is_usable_now());
        assert!(!RegionKind::Reserved.is_usable_now());
    }

    #[test]
    fn rejects_map_missing_low_pages() {
        // Omitting the low pages is as bad as claiming them: nothing then
        // accounts for the null guard and the trampoline.
        let map = [Region::new(0x3000, 0xFD000, RegionKind::Usable)];
        assert_eq!(
            validate(&map.as_slice()),
            Err(MemoryMapError::LowPagesReserved(0))
        );

        let empty: [Region; 0] = [];
        assert_eq!(
            validate(&empty.as_slice()),
            Err(MemoryMapError::Truncated(0))
        );
    }

    #[test]
    fn accepts_zero_based_usable_map() {
        let map = [
            Region::new(0, 0x9F000, RegionKind::Usable),
            Region::new(0x100000, 0x100000, RegionKind::Kernel),
            Region::new(0x200000, 0x700000, RegionKind::Usable),
        ];
        assert_eq!(validate(&map.as_slice()), Ok(()));
    }

    #[test]
    fn rejects_unaligned() {
        let map = [Region::new(0x3800, 0x4000, RegionKind::Usable)];
        assert_eq!(validate(&map.as_slice()), Err(MemoryMapError::Unaligned(0)));
        let map = [Region::new(0x3000, 0x4800, RegionKind::Usable)];
        assert_eq!(validate(&map.as_slice()), Err(MemoryMapError::Unaligned(0)));
    }

    #[test]
    fn rejects_unsorted_or_overlapping() {
        let map = [
            Region::new(0, 0x4000, RegionKind::Usable),
            Region::new(0x10000, 0x4000, RegionKind::Usable),
            Region::new(0x8000, 0x4000, RegionKind::Usable),
        ];
        assert_eq!(validate(&map.as_slice()), Err(MemoryMapError::Unsorted(2)));

        let map = [
            Region::new(0, 0x4000, RegionKind::Usable),
            Region::new(0x8000, 0x4000, RegionKind::Usable),
            Region::new(0xA000, 0x4000, RegionKind::Usable),
        ];
        assert_eq!(validate(&map.as_slice()), Err(MemoryMapError::Unsorted(2)));
    }

    #[test]
    fn rejects_claimed_low_pages() {
        let map = [Region::new(0x1000, 0x4000, RegionKind::Kernel)];
        assert_eq!(
            validate(&map.as_slice()),
            Err(MemoryMapError::LowPagesReserved(0))
        );

        // Zero-based usable region too small to withdraw the guard pages from.
        let map = [Region::new(0, 0x2000, RegionKind::Usable)];
        assert_eq!(
            validate(&map.as_slice()),
            Err(MemoryMapError::LowPagesReserved(0))
        );
    }
}
