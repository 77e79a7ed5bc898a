//! # Allocator Driver Selection
//!
//! Stateless name-to-vtable dispatch. Each physical-allocator implementation
//! is a plain record of function pointers over an opaque handle; a static
//! registry maps the boot command-line token `pmm=<name>` to one of them.
//! Unknown names fall back to the first registered implementation.

use crate::free_lut::{FreeLutPmm, PmmHandle, PmmStats};
use crate::memory_map::{MemoryMapSource, Region};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// Vtable of one physical-allocator implementation.
///
/// Every operation receives the mapper and the opaque handle `init`
/// produced; the record itself carries no state.
pub struct PmmDriver<M: PhysMapper> {
    /// Selector token (matched against `pmm=<name>`).
    pub name: &'static str,
    /// Initialize from the boot memory map; panics on an invalid map.
    pub init: fn(&M, &dyn MemoryMapSource) -> PmmHandle,
    /// Convert reclaimable regions to free frames.
    pub reclaim: fn(&M, PmmHandle),
    /// Counter snapshot.
    pub stats: fn(&M, PmmHandle) -> PmmStats,
    /// Borrowed view of the canonical memory map.
    pub map: for<'m> fn(&'m M, PmmHandle) -> &'m [Region],
    /// `alloc(count, align_bits, below)`.
    pub alloc: fn(&M, PmmHandle, u64, u8, PhysicalAddress) -> Option<PhysicalAddress>,
    /// `free(base, count)`.
    pub free: fn(&M, PmmHandle, PhysicalAddress, u64),
}

impl<M: PhysMapper> Clone for PmmDriver<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: PhysMapper> Copy for PmmDriver<M> {}

/// The registered implementations; the first is the default.
#[must_use]
pub const fn drivers<M: PhysMapper>() -> [PmmDriver<M>; 1] {
    [PmmDriver {
        name: "freelut",
        init: freelut_init::<M>,
        reclaim: freelut_reclaim::<M>,
        stats: freelut_stats::<M>,
        map: freelut_map::<M>,
        alloc: freelut_alloc::<M>,
        free: freelut_free::<M>,
    }]
}

/// Driver registered under `name`; the first registered one when `name` is
/// unknown or absent.
#[must_use]
pub fn select<M: PhysMapper>(name: Option<&str>) -> PmmDriver<M> {
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

/// Parse `pmm=<name>` out of the boot command line and select.
#[must_use]
pub fn select_from_cmdline<M: PhysMapper>(cmdline: &str) -> PmmDriver<M> {
    select(cmdline_token(cmdline, "pmm="))
}

/// First `<key><value>` token of an ASCII, space-separated command line.
///
/// Shared by both allocator selectors (`pmm=` here, `vmm=` in the virtual
/// allocator's driver layer).
#[must_use]
pub fn cmdline_token<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    cmdline
        .split_ascii_whitespace()
        .find_map(|token| token.strip_prefix(key))
}

fn freelut_init<M: PhysMapper>(mapper: &M, source: &dyn MemoryMapSource) -> PmmHandle {
    FreeLutPmm::init(mapper, source).handle()
}

fn freelut_reclaim<M: PhysMapper>(mapper: &M, handle: PmmHandle) {
    // SAFETY: the handle came from `freelut_init` over the same mapper.
    unsafe { FreeLutPmm::from_handle(mapper, handle) }.reclaim();
}

fn freelut_stats<M: PhysMapper>(mapper: &M, handle: PmmHandle) -> PmmStats {
    // SAFETY: as above.
    unsafe { FreeLutPmm::from_handle(mapper, handle) }.stats()
}

fn freelut_map<M: PhysMapper>(mapper: &M, handle: PmmHandle) -> &[Region] {
    // SAFETY: as above.
    unsafe { FreeLutPmm::from_handle(mapper, handle) }.map()
}

fn freelut_alloc<M: PhysMapper>(
    mapper: &M,
    handle: PmmHandle,
    count: u64,
    align_bits: u8,
    below: PhysicalAddress,
) -> Option<PhysicalAddress> {
    // SAFETY: as above.
    unsafe { FreeLutPmm::from_handle(mapper, handle) }.alloc(count, align_bits, below)
}

fn freelut_free<M: PhysMapper>(mapper: &M, handle: PmmHandle, base: PhysicalAddress, count: u64) {
    // SAFETY: as above.
    unsafe { FreeLutPmm::from_handle(mapper, handle) }.free(base, count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::RegionKind;
    use crate::test_support::TestPhys;

    #[test]
    fn named_selection_and_fallback() {
        assert_eq!(select::<TestPhys>(Some("freelut")).name, "freelut");
        assert_eq!(select::<TestPhys>(Some("nonsense")).name, "freelut");
        assert_eq!(select::<TestPhys>(None).name, "freelut");
    }

    #[test]
    fn cmdline_parsing() {
        assert_eq!(
            cmdline_token("quiet pmm=freelut vmm=other", "pmm="),
            Some("freelut")
        );
        assert_eq!(
            cmdline_token("quiet pmm=freelut vmm=other", "vmm="),
            Some("other")
        );
        assert_eq!(cmdline_token("quiet loglevel=3", "pmm="), None);
        assert_eq!(
            select_from_cmdline::<TestPhys>("pmm=doesnotexist").name,
            "freelut"
        );
    }

    #[test]
    fn vtable_round_trip() {
        let phys = TestPhys::with_frames(64);
        let driver = select::<TestPhys>(Some("freelut"));
        let map = [Region::new(0, 0x20000, RegionKind::Usable)];
        let handle = (driver.init)(&phys, &map.as_slice());

        let stats = (driver.stats)(&phys, handle);
        assert!(stats.pages_free > 0);

        let base = (driver.alloc)(&phys, handle, 2, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(base.as_u64(), 0x3000);
        (driver.free)(&phys, handle, base, 2);
        assert_eq!((driver.stats)(&phys, handle).pages_taken, 0);

        let entries = (driver.map)(&phys, handle);
        assert_eq!(entries[0].kind, RegionKind::NullGuard);

        (driver.reclaim)(&phys, handle);
    }
}
