//! # Per-Space Facade over the Global Allocators
//!
//! Driver selection for the virtual allocator (parse-once, like the
//! physical side) plus the glue that feeds address spaces from the
//! process-wide physical allocator: every frame an address space consumes
//! or releases goes through [`kernel_pmm::global`].
//!
//! Unlike the physical allocator there is no process-wide instance here;
//! each address space is its own handle, and the caller serializes
//! operations per space (typically under the kernel paging lock).

use crate::driver::{self, VmmDriver};
use crate::flags::AllocFlags;
use crate::free_lut::{VmmHandle, VmmStats};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::HhdmPhysMapper;
use kernel_sync::SyncOnceCell;
use kernel_vmem::{FrameSource, PagingCaps, Protect};

static MAPPER: HhdmPhysMapper = HhdmPhysMapper;
static DRIVER: SyncOnceCell<VmmDriver<HhdmPhysMapper>> = SyncOnceCell::new();

/// [`FrameSource`] backed by the process-wide physical allocator.
pub struct GlobalFrames;

impl FrameSource for GlobalFrames {
    fn alloc_frames(&mut self, count: u64) -> Option<PhysicalAddress> {
        kernel_pmm::global::alloc(count)
    }

    fn free_frames(&mut self, base: PhysicalAddress, count: u64) {
        kernel_pmm::global::free(base, count);
    }
}

/// Select the driver from the boot command line (`vmm=<name>`).
///
/// Must run before the first [`create`] to take effect; selection is
/// permanent. Unknown names fall back to the default driver.
pub fn select(cmdline: &str) {
    DRIVER.get_or_init(|| driver::select_from_cmdline(cmdline));
}

/// Name of the driver that is (or will be) serving.
#[must_use]
pub fn selected_name() -> &'static str {
    active().name
}

fn active() -> &'static VmmDriver<HhdmPhysMapper> {
    DRIVER.get_or_init(|| driver::select(None))
}

/// Create a fresh address space backed by the global physical allocator.
#[must_use]
pub fn create(caps: PagingCaps) -> Option<VmmHandle> {
    (active().create)(&MAPPER, &mut GlobalFrames, caps)
}

/// Tear an address space down, returning all its frames.
pub fn destroy(handle: VmmHandle) {
    (active().destroy)(&MAPPER, handle, &mut GlobalFrames);
}

/// Counter snapshot for one address space.
#[must_use]
pub fn stats(handle: VmmHandle) -> VmmStats {
    (active().stats)(&MAPPER, handle)
}

/// Allocate `count` pages aligned to `2^align_bits` bytes.
#[must_use]
pub fn alloc(handle: VmmHandle, count: u64, align_bits: u8, flags: AllocFlags) -> Option<VirtualAddress> {
    (active().alloc)(&MAPPER, handle, &mut GlobalFrames, count, align_bits, flags)
}

/// Allocate `count` pages pinned at `vaddr`.
#[must_use]
pub fn alloc_at(handle: VmmHandle, vaddr: VirtualAddress, count: u64, flags: AllocFlags) -> Option<VirtualAddress> {
    (active().alloc_at)(&MAPPER, handle, &mut GlobalFrames, vaddr, count, flags)
}

/// Free `count` pages at `vaddr`.
pub fn free(handle: VmmHandle, vaddr: VirtualAddress, count: u64) {
    (active().free)(&MAPPER, handle, &mut GlobalFrames, vaddr, count);
}

/// Rewrite the protection of `count` pages at `vaddr`.
pub fn protect(handle: VmmHandle, vaddr: VirtualAddress, count: u64, protect: Protect) {
    (active().protect)(&MAPPER, handle, vaddr, count, protect);
}

/// Set the physical address of the slot containing `vaddr`.
pub fn map(handle: VmmHandle, vaddr: VirtualAddress, paddr: PhysicalAddress) {
    (active().map)(&MAPPER, handle, vaddr, paddr);
}

/// Map `count` pages linearly starting at `vaddr` → `paddr`.
pub fn map_linear(handle: VmmHandle, vaddr: VirtualAddress, paddr: PhysicalAddress, count: u64) {
    (active().map_linear)(&MAPPER, handle, vaddr, paddr, count);
}

/// Translate `vaddr` through one address space.
#[must_use]
pub fn translate(handle: VmmHandle, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
    (active().translate)(&MAPPER, handle, vaddr)
}

/// Root table and paging shape of one address space.
#[must_use]
pub fn root_table(handle: VmmHandle) -> (PhysicalAddress, PagingCaps) {
    (active().root_table)(&MAPPER, handle)
}

/// Install an address space's root table.
///
/// # Safety
/// See [`kernel_vmem::activate`].
pub unsafe fn activate(handle: VmmHandle) {
    unsafe { (active().activate)(&MAPPER, handle) }
}
