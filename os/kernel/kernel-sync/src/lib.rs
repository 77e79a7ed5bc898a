//! # Kernel synchronization primitives
//!
//! The page allocators in this workspace are single-mutator by contract:
//! every public operation assumes the caller holds a coarse exclusive lock.
//! This crate provides the two primitives the allocator facades use for that
//! contract:
//!
//! - [`SpinLock`] — a busy-waiting mutex for short critical sections
//!   (the coarse allocator lock).
//! - [`SyncOnceCell`] — spin-published once-initialization (the parse-once
//!   driver selection).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
