//! # Allocator Driver Selection
//!
//! Stateless name-to-vtable dispatch for the virtual allocator, mirroring
//! the physical allocator's driver layer: a plain record of function
//! pointers per implementation, selected once from the boot command-line
//! token `vmm=<name>`, with fallback to the first registered entry.

use crate::flags::AllocFlags;
use crate::free_lut::{FreeLutVmm, VmmHandle, VmmStats};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::driver::cmdline_token;
use kernel_vmem::{FrameSource, PagingCaps, PhysMapper, Protect};

/// Vtable of one virtual-allocator implementation.
///
/// Operations that create, commit, or release pages take the frame source
/// explicitly; the record itself carries no state.
pub struct VmmDriver<M: PhysMapper> {
    /// Selector token (matched against `vmm=<name>`).
    pub name: &'static str,
    /// Create a fresh address space.
    pub create: fn(&M, &mut dyn FrameSource, PagingCaps) -> Option<VmmHandle>,
    /// Tear an address space down completely.
    pub destroy: fn(&M, VmmHandle, &mut dyn FrameSource),
    /// Counter snapshot.
    pub stats: fn(&M, VmmHandle) -> VmmStats,
    /// `alloc(count, align_bits, flags)`.
    pub alloc: fn(&M, VmmHandle, &mut dyn FrameSource, u64, u8, AllocFlags) -> Option<VirtualAddress>,
    /// `alloc_at(vaddr, count, flags)`.
    pub alloc_at:
        fn(&M, VmmHandle, &mut dyn FrameSource, VirtualAddress, u64, AllocFlags) -> Option<VirtualAddress>,
    /// `free(vaddr, count)`.
    pub free: fn(&M, VmmHandle, &mut dyn FrameSource, VirtualAddress, u64),
    /// `protect(vaddr, count, protect)`.
    pub protect: fn(&M, VmmHandle, VirtualAddress, u64, Protect),
    /// `map(vaddr, paddr)`.
    pub map: fn(&M, VmmHandle, VirtualAddress, PhysicalAddress),
    /// `map_linear(vaddr, paddr, count)`.
    pub map_linear: fn(&M, VmmHandle, VirtualAddress, PhysicalAddress, u64),
    /// `translate(vaddr)`.
    pub translate: fn(&M, VmmHandle, VirtualAddress) -> Option<PhysicalAddress>,
    /// Root table plus paging shape for the activation contract.
    pub root_table: fn(&M, VmmHandle) -> (PhysicalAddress, PagingCaps),
    /// Install the root table (CPL0 only).
    pub activate: unsafe fn(&M, VmmHandle),
}

impl<M: PhysMapper> Clone for VmmDriver<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: PhysMapper> Copy for VmmDriver<M> {}

/// The registered implementations; the first is the default.
#[must_use]
pub const fn drivers<M: PhysMapper>() -> [VmmDriver<M>; 1] {
    [VmmDriver {
        name: "freelut",
        create: freelut_create::<M>,
        destroy: freelut_destroy::<M>,
        stats: freelut_stats::<M>,
        alloc: freelut_alloc::<M>,
        alloc_at: freelut_alloc_at::<M>,
        free: freelut_free::<M>,
        protect: freelut_protect::<M>,
        map: freelut_map::<M>,
        map_linear: freelut_map_linear::<M>,
        translate: freelut_translate::<M>,
        root_table: freelut_root_table::<M>,
        activate: freelut_activate::<M>,
    }]
}

/// Driver registered under `name`; the first registered one when `name` is
/// unknown or absent.
#[must_use]
pub fn select<M: PhysMapper>(name: Option<&str>) -> VmmDriver<M> {
    let table = drivers::<M>();
    if let Some(name) = name {
        for driver in &table {
            if driver.name == name {
                return *driver;
            }
        }
    }
    table[0]
}

/// Parse `vmm=<name>` out of the boot command line and select.
#[must_use]
pub fn select_from_cmdline<M: PhysMapper>(cmdline: &str) -> VmmDriver<M> {
    select(cmdline_token(cmdline, "vmm="))
}

fn freelut_create<M: PhysMapper>(
    mapper: &M,
    frames: &mut dyn FrameSource,
    caps: PagingCaps,
) -> Option<VmmHandle> {
    let vmm = FreeLutVmm::create(mapper, frames, caps)?;
    Some(vmm.handle())
}

fn freelut_destroy<M: PhysMapper>(mapper: &M, handle: VmmHandle, frames: &mut dyn FrameSource) {
    // SAFETY: the handle came from `freelut_create` over the same mapper.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.destroy(frames);
}

fn freelut_stats<M: PhysMapper>(mapper: &M, handle: VmmHandle) -> VmmStats {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.stats()
}

fn freelut_alloc<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
    frames: &mut dyn FrameSource,
    count: u64,
    align_bits: u8,
    flags: AllocFlags,
) -> Option<VirtualAddress> {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.alloc(frames, count, align_bits, flags)
}

fn freelut_alloc_at<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
    frames: &mut dyn FrameSource,
    vaddr: VirtualAddress,
    count: u64,
    flags: AllocFlags,
) -> Option<VirtualAddress> {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.alloc_at(frames, vaddr, count, flags)
}

fn freelut_free<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
    frames: &mut dyn FrameSource,
    vaddr: VirtualAddress,
    count: u64,
) {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.free(frames, vaddr, count);
}

fn freelut_protect<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
    vaddr: VirtualAddress,
    count: u64,
    protect: Protect,
) {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.protect(vaddr, count, protect);
}

fn freelut_map<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
) {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.map(vaddr, paddr);
}

fn freelut_map_linear<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    count: u64,
) {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.map_linear(vaddr, paddr, count);
}

fn freelut_translate<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
    vaddr: VirtualAddress,
) -> Option<PhysicalAddress> {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.translate(vaddr)
}

fn freelut_root_table<M: PhysMapper>(
    mapper: &M,
    handle: VmmHandle,
) -> (PhysicalAddress, PagingCaps) {
    // SAFETY: as above.
    unsafe { FreeLutVmm::from_handle(mapper, handle) }.root_table()
}

unsafe fn freelut_activate<M: PhysMapper>(mapper: &M, handle: VmmHandle) {
    // SAFETY: handle validity as above; the CPL0 contract is the caller's.
    unsafe { FreeLutVmm::from_handle(mapper, handle).activate() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::SizeClass;
    use crate::test_support::{BumpFrames, TestPhys};

    #[test]
    fn named_selection_and_fallback() {
        assert_eq!(select::<TestPhys>(Some("freelut")).name, "freelut");
        assert_eq!(select::<TestPhys>(Some("nonsense")).name, "freelut");
        assert_eq!(select_from_cmdline::<TestPhys>("pmm=x vmm=freelut").name, "freelut");
        assert_eq!(select_from_cmdline::<TestPhys>("vmm=unknown").name, "freelut");
    }

    #[test]
    fn vtable_round_trip() {
        let phys = TestPhys::with_frames(256);
        let mut frames = BumpFrames::new(0x10_000, 0x100_000);
        let driver = select::<TestPhys>(None);

        let handle = (driver.create)(&phys, &mut frames, PagingCaps::four_level()).unwrap();
        let flags = AllocFlags::request(SizeClass::Page4K, Protect::ReadWrite);
        let v = (driver.alloc)(&phys, handle, &mut frames, 2, 12, flags).unwrap();
        (driver.map)(&phys, handle, v, PhysicalAddress::new(0x5000));
        assert_eq!(
            (driver.translate)(&phys, handle, v),
            Some(PhysicalAddress::new(0x5000))
        );
        (driver.protect)(&phys, handle, v, 2, Protect::ReadOnly);
        assert_eq!(
            (driver.translate)(&phys, handle, v),
            Some(PhysicalAddress::new(0x5000))
        );

        let (root, caps) = (driver.root_table)(&phys, handle);
        assert!(!root.is_zero());
        assert_eq!(caps.levels, 4);

        (driver.free)(&phys, handle, &mut frames, v, 2);
        assert_eq!((driver.stats)(&phys, handle).pages_allocated, 0);
        (driver.destroy)(&phys, handle, &mut frames);
        assert_eq!(frames.outstanding(), 0);
    }
}
