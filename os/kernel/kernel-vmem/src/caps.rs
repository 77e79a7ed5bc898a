//! # Paging Capabilities & Activation
//!
//! Depth and huge-leaf support of the translation hardware, plus the single
//! privileged operation the allocators ever request: installing a root table.

use kernel_memory_addresses::PhysicalAddress;

/// What the translation hardware supports.
///
/// The virtual address-space allocator sizes its translatable range from
/// `levels` and silently degrades 1 GiB requests when `huge_1gib` is false.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PagingCaps {
    /// Page-table depth (4, or 5 with CR4.LA57).
    pub levels: u8,
    /// Whether 1 GiB leaves (PDPTE.PS) are available.
    pub huge_1gib: bool,
}

impl PagingCaps {
    /// Plain 4-level paging without 1 GiB leaves; the lowest common
    /// denominator and the default for tests.
    #[inline]
    #[must_use]
    pub const fn four_level() -> Self {
        Self {
            levels: 4,
            huge_1gib: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn new(levels: u8, huge_1gib: bool) -> Self {
        debug_assert!(levels >= 1 && levels <= 5);
        Self { levels, huge_1gib }
    }

    /// Number of 4 KiB page slots the translatable range spans.
    #[inline]
    #[must_use]
    pub const fn total_pages(self) -> u64 {
        1 << (9 * self.levels)
    }

    /// Probe the current CPU: 1 GiB leaves via CPUID `0x8000_0001` EDX bit
    /// 26, depth via CR4.LA57.
    ///
    /// # Safety
    /// Must run at CPL0 (reads CR4).
    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub unsafe fn detect() -> Self {
        let ext = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
        let huge_1gib = ext.edx & (1 << 26) != 0;

        let cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        let levels = if cr4 & (1 << 12) != 0 { 5 } else { 4 };

        Self { levels, huge_1gib }
    }

    /// Non-x86-64 stand-in so hosted tooling still links; reports plain
    /// 4-level paging.
    ///
    /// # Safety
    /// Trivially safe; mirrors the x86-64 signature.
    #[cfg(not(target_arch = "x86_64"))]
    #[must_use]
    pub unsafe fn detect() -> Self {
        Self::four_level()
    }
}

/// Load CR3 with `root`, making that page-table tree the active address
/// space.
///
/// `caps` must describe the paging mode the control registers are already
/// configured for; this function does not touch CR4/EFER.
///
/// # Safety
/// - Must run at CPL0 with paging enabled.
/// - `root` must point at a valid, physically-backed top-level table whose
///   kernel mappings cover the currently executing code.
/// - The CPU paging state (CR0/CR4/EFER) must be consistent with `caps`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn activate(root: PhysicalAddress, caps: PagingCaps) {
    debug_assert!(caps.levels == 4 || caps.levels == 5);
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
}

/// Non-x86-64 stand-in; activation is meaningless off-target.
///
/// # Safety
/// Never sound to call; present only so dependent crates link on the host.
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn activate(_root: PhysicalAddress, _caps: PagingCaps) {
    unimplemented!("page-table activation is x86-64 only");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_pages_by_depth() {
        assert_eq!(PagingCaps::four_level().total_pages(), 1 << 36);
        assert_eq!(PagingCaps::new(5, true).total_pages(), 1 << 45);
    }
}
