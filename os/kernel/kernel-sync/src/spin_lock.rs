//! # Spin Lock

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A tiny spinlock for short critical sections.
///
/// This lock is suitable for **uniprocessor** or early boot stages where:
/// - Preemption is either disabled or non-existent.
/// - Critical sections are very short (no I/O, no blocking).
///
/// # Guarantees
/// - Provides mutual exclusion for access to the protected value.
/// - `Sync` is implemented when `T: Send`, allowing shared references across
///   threads (the lock enforces interior mutability).
///
/// # Caveats
/// - Does **not** disable interrupts.
/// - Busy-waits with `spin_loop`, so keep critical sections small.
pub struct SpinLock<T> {
    /// Lock state (`false` = unlocked, `true` = locked).
    locked: AtomicBool,
    /// The protected value.
    inner: UnsafeCell<T>,
}

// Safety: SpinLock provides mutual exclusion; it can be shared across threads as long as T is Send.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new spinlock wrapping `inner`.
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    ///
    /// The returned guard releases the lock on drop.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Acquire the lock if it is free, without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Execute `f` with exclusive access to the inner value.
    ///
    /// Spins until the lock is acquired, then releases it after `f` returns
    /// (also on unwind, via the guard drop).
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Access the inner value through `&mut self` (no locking needed).
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// RAII guard for [`SpinLock`]; releases the lock on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
