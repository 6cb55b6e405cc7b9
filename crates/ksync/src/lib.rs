//! Kernel spinlock primitives.
//!
//! In a kernel there is no `std::sync`; mutual exclusion between CPUs is
//! built on a spinning test-and-set flag. This crate provides the raw
//! flag ([`RawSpinLock`]) and a data-carrying RAII wrapper ([`SpinLock`])
//! around it.
//!
//! These locks know nothing about the interrupt flag. Code that can be
//! re-entered from interrupt context must disable interrupts around the
//! critical section itself; the kernel's scheduler and interrupt entry
//! paths already run with interrupts off, and the panic path relies on
//! being able to force a lock open without any interrupt bookkeeping.
#![no_std]

mod raw;

pub use raw::RawSpinLock;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A value protected by a test-and-set spinlock.
///
/// `lock()` spins until the lock is acquired and returns a guard that
/// releases it on drop, so the lock can never be leaked locked on a
/// normal exit path.
///
/// # Examples
/// ```
/// use ksync::SpinLock;
///
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
///
/// *COUNTER.lock() += 1;
/// assert_eq!(*COUNTER.lock(), 1);
/// ```
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner value, so sharing
// the wrapper between threads is sound whenever moving the value between
// threads would be.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked spinlock wrapping `value`.
    ///
    /// `const` so spinlocks can live in statics.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning while it is held elsewhere.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the inner value.
    ///
    /// `&mut self` proves there are no other users, so no locking is
    /// needed. Useful during single-CPU initialization.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Runs `f` with the lock held.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Releases the lock regardless of ownership.
    ///
    /// # Safety
    /// Only sound when the owner can no longer run (e.g. after the panic
    /// protocol has halted every other CPU). A subsequent `lock()` by the
    /// caller then wins cleanly.
    pub unsafe fn force_unlock(&self) {
        self.raw.unlock();
    }
}

/// RAII guard for a held [`SpinLock`]. Releases the lock on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard's existence proves we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard's existence proves we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
