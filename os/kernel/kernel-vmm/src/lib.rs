//! # Virtual Address-Space Allocator (VMM)
//!
//! Page-granular virtual memory management. One allocator instance owns one
//! address space and simultaneously maintains:
//!
//! - the **architectural page tables** the MMU walks (through the codec in
//!   [`kernel_vmem`] — this crate never interprets entry bits itself), and
//! - a parallel **range table** of identical shape, tagging every slot as
//!   free, sub-table, mapped, reserved, lazily-committed, or paged to disk.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Driver facade (global)               │
//! │    • vmm=<name> selection, once                     │
//! │    • per-space handles over the global PMM          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              FreeLUT core (free_lut)                │
//! │    • alloc / alloc_at / free / protect              │
//! │    • map / map_linear / translate / activate        │
//! └───────┬──────────────────────┬──────────────────────┘
//!         │                      │
//! ┌───────▼──────────┐  ┌────────▼────────────────────┐
//! │ Range table      │  │ Descriptor slab             │
//! │ slot state tags  │  │ 127 descriptors per page    │
//! └──────────────────┘  └─────────────────────────────┘
//! ```
//!
//! Free virtual ranges use the same size-bucket discipline as the physical
//! allocator ([`kernel_pmm::lut`]), but their descriptors live in slab
//! pages rather than in the free memory itself — writing descriptors into
//! unmapped virtual space would require committing it.
//!
//! Physical frames (table pairs, slab pages, committed mappings) come from
//! a [`kernel_vmem::FrameSource`], normally the process-wide physical
//! allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod driver;
pub mod flags;
pub mod free_lut;
pub mod global;
pub mod range_table;
pub mod slab;

pub use driver::VmmDriver;
pub use flags::{AllocFlags, SizeClass};
pub use free_lut::{FreeLutVmm, VmmHandle, VmmStats};
pub use range_table::{RangeEntry, RangeKind, RangeTable};
