//! # HHDM-based PhysMapper
//!
//! Production [`PhysMapper`] for a kernel that keeps a higher-half direct
//! map: every physical address is visible at `HHDM_BASE + pa`.
//!
//! The allocators take the mapper as a type parameter, so tests substitute a
//! buffer-backed fake; this is the implementation the kernel wires in.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// Base of the higher-half direct map.
///
/// Anything mapped at `HHDM_BASE + pa` lets the kernel access physical
/// memory via a fixed offset. Must agree with the boot-time paging setup.
pub const HHDM_BASE: u64 = 0xFFFF_8880_0000_0000;

/// [`PhysMapper`] adding the higher-half direct-map offset.
///
/// # Safety
/// - The HHDM mapping must be present and cover the referenced physical
///   range before any allocator call.
/// - The returned pointer must only be used for valid, mapped, writable
///   memory.
#[derive(Copy, Clone, Default)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (HHDM_BASE + pa.as_u64()) as *mut T;
        // SAFETY: caller ensures the physical address is valid and the HHDM
        // covers it.
        unsafe { &mut *va }
    }
}
