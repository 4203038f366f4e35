//! Busy-wait mutual exclusion.
//!
//! For contexts where parking a thread is not allowed (signal handlers,
//! loader callbacks). Everywhere else use [`crate::ReadWriteLock`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::thread_id::{self, NO_THREAD};

/// Non-reentrant spin lock that remembers its owner.
///
/// Locking twice from the same thread, unlocking from a thread that does
/// not own the lock, or dropping a locked mutex are programming errors and
/// abort debug builds.
#[derive(Debug, Default)]
pub struct SpinMutex {
    owner: AtomicU64,
}

impl SpinMutex {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(NO_THREAD),
        }
    }

    /// Spin until the calling thread owns the lock.
    pub fn lock(&self) {
        let me = thread_id::current();
        debug_assert_ne!(
            self.owner.load(Ordering::Relaxed),
            me,
            "SpinMutex is not reentrant"
        );

        while self
            .owner
            .compare_exchange_weak(NO_THREAD, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
    }

    /// Single acquisition attempt.
    pub fn try_lock(&self) -> bool {
        self.owner
            .compare_exchange(
                NO_THREAD,
                thread_id::current(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Release the lock. Must be called by the owning thread; otherwise
    /// this is a no-op in release builds.
    pub fn unlock(&self) {
        let released = self
            .owner
            .compare_exchange(
                thread_id::current(),
                NO_THREAD,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok();
        debug_assert!(released, "SpinMutex unlocked by a thread that does not own it");
    }

    /// Whether the calling thread holds the lock.
    pub fn owned(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread_id::current()
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self) -> SpinGuard<'_> {
        self.lock();
        SpinGuard { mutex: self }
    }
}

impl Drop for SpinMutex {
    fn drop(&mut self) {
        // Unwinding past a held lock is already being reported.
        debug_assert!(
            *self.owner.get_mut() == NO_THREAD || std::thread::panicking(),
            "SpinMutex dropped while locked"
        );
    }
}

pub struct SpinGuard<'a> {
    mutex: &'a SpinMutex,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
