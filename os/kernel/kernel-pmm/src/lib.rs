//! # Physical Page Allocator (PMM)
//!
//! Frame-granular physical memory management for the kernel, built around
//! the FreeLUT design:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Driver facade (global)              │
//! │    • pmm=<name> selection, once                     │
//! │    • coarse lock around every operation             │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              FreeLUT core (free_lut)                │
//! │    • boot-map sanitation and canonical map          │
//! │    • free runs as in-frame headers (±count)         │
//! │    • 255 size buckets with skip-forward heads       │
//! └───────┬─────────────────────────────┬───────────────┘
//!         │                             │
//! ┌───────▼───────────┐   ┌─────────────▼───────────────┐
//! │ Frame bitmap      │   │ Size-index LUT (lut)        │
//! │ 1 bit per frame   │   │ identity ≤ 192, then 2^n    │
//! └───────────────────┘   └─────────────────────────────┘
//! ```
//!
//! ## Key properties
//!
//! - **O(1) hot path**: allocation is a bucket-head pop plus an O(1) split;
//!   freeing is two bitmap probes plus an O(1) merge.
//! - **Zero metadata memory**: free-run descriptors live inside the free
//!   frames they describe; the only reserved memory is the state header,
//!   the bitmap, and the canonical memory map, placed at the top of the
//!   largest usable region.
//! - **Single-mutator**: callers serialize operations; the
//!   [`global`] facade wraps everything in the kernel-wide lock.
//!
//! All physical access goes through [`kernel_vmem::PhysMapper`], which is
//! what makes the whole allocator runnable (and tested) on a host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod bitmap;
pub mod driver;
pub mod free_lut;
pub mod global;
pub mod lut;
pub mod memory_map;
pub mod phys_mapper;

pub use driver::PmmDriver;
pub use free_lut::{FreeLutPmm, PmmHandle, PmmStats};
pub use memory_map::{MemoryMapError, MemoryMapSource, Region, RegionKind};
pub use phys_mapper::HhdmPhysMapper;

/// Buffer-backed fake physical memory shared by this crate's unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::PhysMapper;

    /// A 4 KiB-aligned raw frame; the backing store for fake physical RAM.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Fake physical memory: physical address = byte offset into the buffer.
    pub struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
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
            // SAFETY: bounds-checked above; tests keep accesses disjoint.
            unsafe { &mut *base.add(addr).cast::<T>() }
        }
    }
}
