//! Drive the virtual allocator on top of the real physical allocator over
//! one shared fake physical memory, the way the kernel wires them.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::{FreeLutPmm, Region, RegionKind};
use kernel_vmem::{PagingCaps, PhysMapper, Protect};
use kernel_vmm::{AllocFlags, FreeLutVmm, SizeClass};

/// A 4 KiB-aligned raw frame backing the fake physical RAM.
#[repr(align(4096))]
struct Aligned4K([u8; 4096]);

/// Fake physical memory: physical address = byte offset into the buffer.
struct TestPhys {
    frames: Vec<Aligned4K>,
}

impl TestPhys {
    fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(Aligned4K([0u8; 4096]));
        }
        Self { frames }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let addr = pa.as_u64() as usize;
        assert!(
            addr + size_of::<T>() <= self.frames.len() * 4096,
            "physical address {addr:#x} outside test memory"
        );
        let base = self.frames.as_ptr() as *mut u8;
        // SAFETY: bounds-checked above; the allocators keep their accesses
        // disjoint.
        unsafe { &mut *base.add(addr).cast::<T>() }
    }
}

const RW: AllocFlags = AllocFlags::request(SizeClass::Page4K, Protect::ReadWrite);

#[test]
fn address_space_over_physical_allocator() {
    // 4 MiB of "RAM"; init withdraws the guard pages itself.
    let phys = TestPhys::with_frames(1024);
    let map = [Region::new(0, 0x40_0000, RegionKind::Usable)];
    let mut pmm = FreeLutPmm::init(&phys, &map.as_slice());
    let baseline = pmm.stats();
    assert_eq!(baseline.pages_taken, 0);

    let mut vmm = FreeLutVmm::create(&phys, &mut pmm, PagingCaps::four_level()).unwrap();
    let after_create = pmm.stats();
    // State block, root pair, and the first descriptor slab all came from
    // the physical allocator.
    assert_eq!(after_create.pages_taken, vmm.stats().footprint_pages);

    // Reserve a range, then commit every page with its own frame.
    let v0 = vmm.alloc(&mut pmm, 8, 12, RW).unwrap();
    let mut backing = Vec::new();
    for k in 0..8u64 {
        let frame = pmm.alloc(1, 12, PhysicalAddress::MAX).unwrap();
        vmm.map(v0 + k * 0x1000, frame);
        backing.push(frame);
    }
    assert_eq!(vmm.stats().pages_mapped, 8);
    for (k, frame) in backing.iter().enumerate() {
        assert_eq!(vmm.translate(v0 + k as u64 * 0x1000), Some(*frame));
    }

    // Freeing the virtual range hands the backing frames back to the PMM.
    let taken_before_free = pmm.stats().pages_taken;
    vmm.free(&mut pmm, v0, 8);
    assert_eq!(pmm.stats().pages_taken, taken_before_free - 8);
    assert_eq!(vmm.stats().pages_mapped, 0);
    assert_eq!(vmm.stats().pages_allocated, 0);

    // Tearing the space down restores the physical allocator exactly.
    vmm.destroy(&mut pmm);
    let end = pmm.stats();
    assert_eq!(end.pages_taken, 0);
    assert_eq!(end.pages_free, baseline.pages_free);
}

#[test]
fn linear_device_window() {
    let phys = TestPhys::with_frames(1024);
    let map = [Region::new(0, 0x40_0000, RegionKind::Usable)];
    let mut pmm = FreeLutPmm::init(&phys, &map.as_slice());
    let mut vmm = FreeLutVmm::create(&phys, &mut pmm, PagingCaps::four_level()).unwrap();

    // A physically contiguous buffer, mapped linearly and remapped
    // read-only, as a framebuffer window would be.
    let buffer = pmm.alloc(16, 12, PhysicalAddress::MAX).unwrap();
    let window = vmm.alloc(&mut pmm, 16, 12, RW).unwrap();
    vmm.map_linear(window, buffer, 16);
    for k in 0..16u64 {
        assert_eq!(
            vmm.translate(window + k * 0x1000),
            Some(buffer + k * 0x1000)
        );
    }
    vmm.protect(window, 16, Protect::ReadOnly);
    assert_eq!(vmm.translate(window), Some(buffer));

    vmm.free(&mut pmm, window, 16);
    // The buffer frames were owned by the mapping and went back to the PMM.
    let refit = pmm.alloc(16, 12, PhysicalAddress::MAX).unwrap();
    assert_eq!(refit, buffer);

    pmm.free(refit, 16);
    vmm.destroy(&mut pmm);
    assert_eq!(pmm.stats().pages_taken, 0);
}
