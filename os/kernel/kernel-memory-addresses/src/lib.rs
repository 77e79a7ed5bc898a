//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page bases, and the
//! frame/page **indices** the page allocators account in.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers
//! around `u64` values.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 64-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Frames and pages as indices
//!
//! The physical page allocator identifies a 4 KiB frame by its **frame
//! index** (`physical_address / 4096`); the virtual allocator identifies a
//! 4 KiB slot by its **page index** (`virtual_address / 4096`). The
//! conversions live on [`PhysicalAddress`] and [`VirtualAddress`]:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x3000);
//! assert_eq!(pa.frame_index(), 3);
//! assert_eq!(PhysicalAddress::from_frame_index(3), pa);
//!
//! let va = VirtualAddress::new(0xFFFF_8000_0000_1000);
//! assert_eq!(VirtualAddress::from_page_index(va.page_index()), va);
//! ```
//!
//! ## Page Sizes
//!
//! Three standard x86-64 page sizes are supported via marker types that
//! implement [`PageSize`]:
//!
//! - [`Size4K`] — 4 KiB pages (base granularity)
//! - [`Size2M`] — 2 MiB huge pages
//! - [`Size1G`] — 1 GiB giant pages
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`,
//!   and `Hash`, making them suitable as map keys or for FFI use.
//! - All alignment and offset calculations are `const fn` and zero-cost in
//!   release builds.
//! - The phantom marker `S` enforces the page size at the type level instead
//!   of using constants, ensuring all conversions are explicit.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::*;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::*;
pub use page_size::*;
pub use physical_address::*;
pub use physical_page::*;
pub use virtual_address::*;
pub use virtual_page::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678_9ABC_DEF0);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u64() & 0xFFF, 0);
        assert_eq!(o.as_u64(), a.as_u64() & 0xFFF);
        assert_eq!(p.join(o).as_u64(), a.as_u64());
    }

    #[test]
    fn split_and_join_2m() {
        let a = MemoryAddress::new(0x0000_0008_1234_5678);
        let (p, o) = a.split::<Size2M>();
        assert_eq!(p.base().as_u64() & (Size2M::SIZE - 1), 0);
        assert_eq!(o.as_u64(), a.as_u64() & (Size2M::SIZE - 1));
        assert_eq!(p.join(o).as_u64(), a.as_u64());
    }

    #[test]
    fn split_and_join_1g() {
        let a = MemoryAddress::new(0x0000_0004_1234_5678);
        let (p, o) = a.split::<Size1G>();
        assert_eq!(p.base().as_u64() & (Size1G::SIZE - 1), 0);
        assert_eq!(o.as_u64(), a.as_u64() & (Size1G::SIZE - 1));
        assert_eq!(p.join(o).as_u64(), a.as_u64());
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        let (vp, vo) = va.split::<Size4K>();
        assert_eq!(vp.base().as_u64() & 0xFFF, 0);
        assert_eq!(vp.join(vo).as_u64(), va.as_u64());

        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let (pp, po) = pa.split::<Size4K>();
        assert_eq!(pp.base().as_u64() & 0xFFF, 0);
        assert_eq!(po.as_u64(), 0x42);
        assert_eq!(pp.join(po).as_u64(), pa.as_u64());
    }

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u64(), 0x12000);
        assert_eq!(a.align_up::<Size4K>().as_u64(), 0x13000);
        assert_eq!(a.page::<Size4K>().base().as_u64(), 0x12000);
        assert_eq!(a.offset::<Size4K>().as_u64(), 0x345);
    }

    #[test]
    fn frame_index_round_trip() {
        let pa = PhysicalAddress::new(0x0040_3000);
        assert_eq!(pa.frame_index(), 0x403);
        assert_eq!(PhysicalAddress::from_frame_index(0x403), pa);
        assert_eq!(PhysicalAddress::from_frame_index(0).as_u64(), 0);
    }

    #[test]
    fn page_index_round_trip() {
        let va = VirtualAddress::new(0x7000);
        assert_eq!(va.page_index(), 7);
        assert_eq!(VirtualAddress::from_page_index(7), va);
        // Offsets are dropped by the index, not preserved.
        assert_eq!(VirtualAddress::new(0x7FFF).page_index(), 7);
    }
}
