use crate::{MemoryAddressOffset, MemoryPage, PageSize, VirtualAddress};
use core::fmt;

/// Virtual memory page base for size `S`.
///
/// A `VirtualPage<S>` represents the **page-aligned base** of a virtual page
/// of size `S` (`S::SIZE` bytes). It is a thin wrapper over [`MemoryPage<S>`]
/// with virtual-address intent.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> VirtualPage<S> {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(MemoryPage::<S>::containing(addr.as_u64()))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> VirtualAddress {
        VirtualAddress(self.0.join(off))
    }
}

impl<S> fmt::Display for VirtualPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualPage<{}>({:#018X})",
            S::as_str(),
            self.0.base().as_u64()
        )
    }
}

impl<S> From<MemoryPage<S>> for VirtualPage<S>
where
    S: PageSize,
{
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
