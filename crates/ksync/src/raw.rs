//! The raw test-and-set lock underneath [`SpinLock`](crate::SpinLock).
//!
//! A single atomic flag: `false` = unlocked, `true` = locked. Acquiring
//! performs a test-and-set with acquire ordering; releasing is a plain
//! store with release ordering. While contended, the waiter observes the
//! flag with relaxed loads and a spin hint until it reads `false`, then
//! retries the test-and-set.

use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set spinlock flag with no data attached.
///
/// Used directly where the protected state is not a single Rust value
/// (the per-CPU IPI mailbox, the process-wide panic lock), and as the
/// lock word of [`SpinLock`](crate::SpinLock) everywhere else.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Creates a new, unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Returns `true` while some owner holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `true` if the lock was acquired. Acquire ordering applies
    /// only on success.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Acquires the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            // Wait with cheap relaxed reads until the flag falsifies,
            // then retry the acquiring swap.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Releases the lock.
    ///
    /// Also used by the panic path to force a wedged lock open once all
    /// other CPUs are halted; at that point there is no owner left to
    /// race with.
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::RawSpinLock;

    #[test]
    fn lock_unlock_is_a_state_no_op() {
        let l = RawSpinLock::new();
        assert!(!l.is_locked());
        l.lock();
        assert!(l.is_locked());
        l.unlock();
        assert!(!l.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let l = RawSpinLock::new();
        assert!(l.try_lock());
        assert!(!l.try_lock());
        l.unlock();
        assert!(l.try_lock());
        l.unlock();
    }
}
