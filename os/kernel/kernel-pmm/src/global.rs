//! # Process-Wide Allocator Facade
//!
//! The kernel has exactly one physical page allocator. This module owns it:
//! driver selection happens at most once (command-line parse published
//! through a [`SyncOnceCell`]), and every operation trampolines through the
//! selected vtable while holding the coarse [`SpinLock`] the allocator's
//! single-mutator contract requires.
//!
//! Lifecycle: [`select`] (optional) → [`init`] → serve.

use crate::driver::{self, PmmDriver};
use crate::free_lut::{PmmHandle, PmmStats};
use crate::memory_map::{MemoryMapSource, Region};
use crate::phys_mapper::HhdmPhysMapper;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{SpinLock, SyncOnceCell};

static MAPPER: HhdmPhysMapper = HhdmPhysMapper;
static DRIVER: SyncOnceCell<PmmDriver<HhdmPhysMapper>> = SyncOnceCell::new();
static STATE: SpinLock<Option<PmmHandle>> = SpinLock::new(None);

/// Select the driver from the boot command line (`pmm=<name>`).
///
/// Must run before [`init`] to take effect; selection is permanent. Unknown
/// names fall back to the default driver.
pub fn select(cmdline: &str) {
    DRIVER.get_or_init(|| driver::select_from_cmdline(cmdline));
}

/// Name of the driver that is (or will be) serving.
#[must_use]
pub fn selected_name() -> &'static str {
    active().name
}

fn active() -> &'static PmmDriver<HhdmPhysMapper> {
    DRIVER.get_or_init(|| driver::select(None))
}

/// Initialize the process-wide allocator from the boot memory map.
///
/// # Panics
/// If called twice, or if the map violates the init invariants.
pub fn init(source: &dyn MemoryMapSource) {
    let driver = active();
    let mut state = STATE.lock();
    assert!(state.is_none(), "physical allocator initialized twice");
    *state = Some((driver.init)(&MAPPER, source));
}

fn with_allocator<R>(f: impl FnOnce(&PmmDriver<HhdmPhysMapper>, PmmHandle) -> R) -> R {
    let driver = active();
    let state = STATE.lock();
    let Some(handle) = *state else {
        panic!("physical allocator not initialized");
    };
    f(driver, handle)
}

/// Allocate `count` frames at default (4 KiB) alignment.
#[must_use]
pub fn alloc(count: u64) -> Option<PhysicalAddress> {
    alloc_aligned_below(count, 12, PhysicalAddress::MAX)
}

/// Allocate `count` frames aligned to `2^align_bits` bytes.
#[must_use]
pub fn alloc_aligned(count: u64, align_bits: u8) -> Option<PhysicalAddress> {
    alloc_aligned_below(count, align_bits, PhysicalAddress::MAX)
}

/// Allocate `count` frames ending at or below `below`.
#[must_use]
pub fn alloc_below(count: u64, below: PhysicalAddress) -> Option<PhysicalAddress> {
    alloc_aligned_below(count, 12, below)
}

/// Allocate `count` frames aligned to `2^align_bits` bytes, ending at or
/// below `below`. `align_bits` below 12 is treated as 12.
#[must_use]
pub fn alloc_aligned_below(count: u64, align_bits: u8, below: PhysicalAddress) -> Option<PhysicalAddress> {
    with_allocator(|driver, handle| (driver.alloc)(&MAPPER, handle, count, align_bits.max(12), below))
}

/// Return `count` frames starting at `base`.
pub fn free(base: PhysicalAddress, count: u64) {
    with_allocator(|driver, handle| (driver.free)(&MAPPER, handle, base, count));
}

/// Convert reclaimable boot regions into free frames.
pub fn reclaim() {
    with_allocator(|driver, handle| (driver.reclaim)(&MAPPER, handle));
}

/// Counter snapshot.
#[must_use]
pub fn stats() -> PmmStats {
    with_allocator(|driver, handle| (driver.stats)(&MAPPER, handle))
}

/// Run `f` over the canonical memory map while the allocator lock is held.
pub fn with_map<R>(f: impl FnOnce(&[Region]) -> R) -> R {
    with_allocator(|driver, handle| f((driver.map)(&MAPPER, handle)))
}
