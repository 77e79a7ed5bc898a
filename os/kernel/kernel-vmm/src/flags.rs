//! # Allocation Flag Word
//!
//! The packed `u32` callers pass to `alloc`: three nibbles for page size,
//! protection, and options.
//!
//! ```text
//! | 31 .. 12 | 11 .. 8 | 7 .. 4  | 3 .. 0 |
//! | reserved | options | protect |  size  |
//! ```

use bitfield_struct::bitfield;
use kernel_vmem::{PageKind, Protect};

/// Requested leaf granularity (the size nibble).
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SizeClass {
    /// 4 KiB pages.
    #[default]
    Page4K = 0,
    /// 2 MiB pages.
    Page2M = 1,
    /// 1 GiB pages.
    Page1G = 2,
    /// Reserved encoding; treated as 4 KiB.
    Reserved = 3,
}

impl SizeClass {
    /// The page-table level leaves of this class live on.
    #[inline]
    #[must_use]
    pub const fn min_level(self) -> u8 {
        match self {
            Self::Page4K | Self::Reserved => 0,
            Self::Page2M => 1,
            Self::Page1G => 2,
        }
    }

    /// Smallest byte alignment (as a bit count) this class implies.
    #[inline]
    #[must_use]
    pub const fn min_align_bits(self) -> u8 {
        match self {
            Self::Page4K | Self::Reserved => 12,
            Self::Page2M => 21,
            Self::Page1G => 30,
        }
    }

    /// The architectural leaf granularity for this class.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> PageKind {
        match self {
            Self::Page4K | Self::Reserved => PageKind::Page4K,
            Self::Page2M => PageKind::Page2M,
            Self::Page1G => PageKind::Page1G,
        }
    }

    #[inline]
    #[must_use]
    const fn from_bits(v: u8) -> Self {
        match v & 3 {
            0 => Self::Page4K,
            1 => Self::Page2M,
            2 => Self::Page1G,
            _ => Self::Reserved,
        }
    }

    #[inline]
    #[must_use]
    const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// The allocation flag word.
///
/// The option nibble currently defines one bit: **auto-commit** (bit 8),
/// which parks freshly allocated slots in the lazily-committed state
/// instead of plain reserved.
#[bitfield(u32)]
pub struct AllocFlags {
    #[bits(4)]
    size_bits: u8,
    #[bits(4)]
    protect_bits: u8,
    #[bits(4)]
    option_bits: u8,
    /// Reserved (bits 12..31): must be 0.
    #[bits(20)]
    __reserved: u32,
}

impl AllocFlags {
    /// Flags for `size` pages with protection `protect`, no options.
    #[inline]
    #[must_use]
    pub const fn request(size: SizeClass, protect: Protect) -> Self {
        Self::new().with_size(size).with_protect(protect)
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> SizeClass {
        SizeClass::from_bits(self.size_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_size(self, size: SizeClass) -> Self {
        self.with_size_bits(size.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn protect(self) -> Protect {
        Protect::from_bits(self.protect_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_protect(self, protect: Protect) -> Self {
        self.with_protect_bits(protect.into_bits())
    }

    /// Whether freshly allocated slots should commit lazily on first touch.
    #[inline]
    #[must_use]
    pub const fn auto_commit(self) -> bool {
        self.option_bits() & 1 != 0
    }

    #[inline]
    #[must_use]
    pub const fn with_auto_commit(self, auto_commit: bool) -> Self {
        let bits = if auto_commit {
            self.option_bits() | 1
        } else {
            self.option_bits() & !1
        };
        self.with_option_bits(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout() {
        let f = AllocFlags::request(SizeClass::Page2M, Protect::ReadExecute).with_auto_commit(true);
        // size = 1, protect = 3, options = 1
        assert_eq!(f.into_bits(), 0x131);
        assert_eq!(f.size(), SizeClass::Page2M);
        assert_eq!(f.protect(), Protect::ReadExecute);
        assert!(f.auto_commit());

        let plain = AllocFlags::new();
        assert_eq!(plain.into_bits(), 0);
        assert_eq!(plain.size(), SizeClass::Page4K);
        assert_eq!(plain.protect(), Protect::ReadWrite);
        assert!(!plain.auto_commit());
    }

    #[test]
    fn size_class_levels_and_alignment() {
        assert_eq!(SizeClass::Page4K.min_level(), 0);
        assert_eq!(SizeClass::Page2M.min_level(), 1);
        assert_eq!(SizeClass::Page1G.min_level(), 2);
        assert_eq!(SizeClass::Page4K.min_align_bits(), 12);
        assert_eq!(SizeClass::Page2M.min_align_bits(), 21);
        assert_eq!(SizeClass::Page1G.min_align_bits(), 30);
        assert_eq!(SizeClass::Reserved.min_level(), 0);
    }
}
