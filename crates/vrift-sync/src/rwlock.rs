//! Shared/exclusive lock with recursive write ownership.
//!
//! Unlike `std::sync::RwLock` this lock guards no data: it brackets access to
//! state that lives elsewhere (directory metadata, pool slots). Acquisition
//! and release are separate calls so a lock can be held across API
//! boundaries; the [`ReadGuard`]/[`WriteGuard`] wrappers give scoped
//! discipline on top.
//!
//! Policy:
//! - Once a writer is waiting, new readers queue behind it. Readers already
//!   inside are not pre-empted.
//! - The write owner may re-enter with `lock_write`/`lock_read`; each
//!   re-entry needs its own `unlock`.
//! - `unlock(true)` on the final write release downgrades to a read lock.
//! - A reader cannot re-enter `try_lock_read` while a writer is pending,
//!   even though it already holds read access. Allowing it would let a
//!   stream of recursive readers starve the writer.
//! - Upgrading a held read lock with `lock_write` deadlocks.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::thread_id::{self, NO_THREAD};

// Waits are sliced so a lost notification costs at most one slice.
const WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct ReadWriteLock {
    /// Writers waiting for or holding exclusive access. The mutex itself is
    /// held by the write owner for the whole exclusive section.
    exclusive: Mutex<usize>,
    /// Active shared holders.
    concurrent: AtomicUsize,
    owner: AtomicU64,
    /// Re-entries by `owner`. Only touched by the owning thread.
    depth: AtomicUsize,
    readers: Condvar,
    writers: Condvar,
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadWriteLock {
    pub const fn new() -> Self {
        Self {
            exclusive: Mutex::new(0),
            concurrent: AtomicUsize::new(0),
            owner: AtomicU64::new(NO_THREAD),
            depth: AtomicUsize::new(0),
            readers: Condvar::new(),
            writers: Condvar::new(),
        }
    }

    /// Whether the calling thread holds the write lock.
    #[inline]
    pub fn owns_write(&self) -> bool {
        self.owner.load(Ordering::Acquire) == thread_id::current()
    }

    pub fn lock_read(&self) {
        if self.owns_write() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut pending = self.exclusive.lock();
        while *pending > 0 {
            self.readers.wait_for(&mut pending, WAIT_SLICE);
        }
        self.concurrent.fetch_add(1, Ordering::AcqRel);
    }

    pub fn lock_write(&self) {
        if self.owns_write() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut pending = self.exclusive.lock();
        // Counting ourselves in blocks new readers from here on.
        *pending += 1;
        while self.concurrent.load(Ordering::Acquire) != 0 {
            self.writers.wait_for(&mut pending, WAIT_SLICE);
        }
        *pending -= 1;
        self.take_ownership(pending);
    }

    pub fn try_lock_read(&self) -> bool {
        if self.owns_write() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let Some(pending) = self.exclusive.try_lock() else {
            return false;
        };
        if *pending > 0 {
            return false;
        }
        self.concurrent.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn try_lock_write(&self) -> bool {
        if self.owns_write() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let Some(pending) = self.exclusive.try_lock() else {
            return false;
        };
        if self.concurrent.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.take_ownership(pending);
        true
    }

    /// Release one acquisition made by the calling thread.
    ///
    /// With `exclusive_only` set, the final release of a write lock keeps a
    /// read lock (downgrade); a re-entered write lock stays fully exclusive
    /// and nothing changes. Readers passing `exclusive_only` are ignored.
    pub fn unlock(&self, exclusive_only: bool) {
        if self.owns_write() {
            if self.depth.load(Ordering::Relaxed) > 0 {
                if !exclusive_only {
                    self.depth.fetch_sub(1, Ordering::Relaxed);
                }
                return;
            }

            if exclusive_only {
                self.concurrent.fetch_add(1, Ordering::AcqRel);
            }
            self.owner.store(NO_THREAD, Ordering::Release);
            self.readers.notify_all();
            self.writers.notify_all();
            // SAFETY: the mutex was locked by `take_ownership` on this thread
            // and its guard forgotten; we are the owner releasing it.
            unsafe { self.exclusive.force_unlock() };
            return;
        }

        if exclusive_only {
            return;
        }

        let released = self
            .concurrent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match released {
            Ok(1) => {
                // Last reader out: wake writers waiting for the count to drain.
                // Never block on the mutex, a new write owner keeps it for its
                // whole section. A wakeup lost here costs one wait slice.
                match self.exclusive.try_lock() {
                    Some(pending) if *pending == 0 => {}
                    _ => {
                        self.writers.notify_all();
                    }
                }
            }
            Ok(_) => {}
            Err(_) => debug_assert!(false, "ReadWriteLock unlocked without being held"),
        }
    }

    pub fn read(&self) -> ReadGuard<'_> {
        self.lock_read();
        ReadGuard::new(self)
    }

    pub fn write(&self) -> WriteGuard<'_> {
        self.lock_write();
        WriteGuard::new(self)
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        self.try_lock_read().then(|| ReadGuard::new(self))
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        self.try_lock_write().then(|| WriteGuard::new(self))
    }

    /// Writers currently waiting, or `None` while a writer owns the lock.
    pub fn pending_writers(&self) -> Option<usize> {
        self.exclusive.try_lock().map(|pending| *pending)
    }

    /// Active shared holders.
    pub fn readers(&self) -> usize {
        self.concurrent.load(Ordering::Acquire)
    }

    fn take_ownership(&self, guard: MutexGuard<'_, usize>) {
        // The mutex stays locked until the matching final `unlock`.
        std::mem::forget(guard);
        self.depth.store(0, Ordering::Relaxed);
        self.owner.store(thread_id::current(), Ordering::Release);
    }
}

impl Drop for ReadWriteLock {
    fn drop(&mut self) {
        debug_assert_eq!(
            *self.owner.get_mut(),
            NO_THREAD,
            "ReadWriteLock dropped while write-locked"
        );
        debug_assert_eq!(*self.concurrent.get_mut(), 0, "ReadWriteLock dropped while read-locked");
    }
}

/// Shared acquisition released on drop. Not `Send`: recursive acquisitions
/// by the write owner are tracked per thread.
pub struct ReadGuard<'a> {
    lock: &'a ReadWriteLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadGuard<'a> {
    fn new(lock: &'a ReadWriteLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(false);
    }
}

/// Exclusive acquisition released on drop.
pub struct WriteGuard<'a> {
    lock: &'a ReadWriteLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteGuard<'a> {
    fn new(lock: &'a ReadWriteLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Trade exclusive access for shared access without letting a writer in
    /// between.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let lock = self.lock;
        std::mem::forget(self);
        lock.unlock(true);
        ReadGuard::new(lock)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Instant;

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_writers_are_mutually_exclusive() {
        let lock = ReadWriteLock::new();
        let writers = AtomicUsize::new(0);
        let readers = AtomicUsize::new(0);

        thread::scope(|s| {
            for i in 0..8 {
                let (lock, writers, readers) = (&lock, &writers, &readers);
                s.spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            let _w = lock.write();
                            assert!(lock.owns_write());
                            assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers.load(Ordering::SeqCst), 0);
                            writers.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let _r = lock.read();
                            assert!(!lock.owns_write());
                            readers.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(writers.load(Ordering::SeqCst), 0);
                            readers.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(lock.readers(), 0);
        assert!(lock.try_lock_write());
        lock.unlock(false);
    }

    #[test]
    fn test_recursive_write_needs_matching_unlocks() {
        let lock = ReadWriteLock::new();
        lock.lock_write();
        lock.lock_write();
        lock.lock_read();
        assert!(lock.owns_write());

        lock.unlock(false);
        lock.unlock(false);
        assert!(lock.owns_write());

        thread::scope(|s| {
            assert!(!s.spawn(|| lock.try_lock_read()).join().unwrap());
        });

        lock.unlock(false);
        assert!(!lock.owns_write());

        thread::scope(|s| {
            s.spawn(|| {
                assert!(lock.try_lock_write());
                lock.unlock(false);
            });
        });
    }

    #[test]
    fn test_exclusive_only_keeps_recursive_write() {
        let lock = ReadWriteLock::new();
        lock.lock_write();
        lock.lock_write();

        lock.unlock(true);
        assert!(lock.owns_write());

        lock.unlock(false);
        lock.unlock(false);
        assert!(!lock.owns_write());
        assert_eq!(lock.readers(), 0);
    }

    #[test]
    fn test_pending_writer_goes_before_later_reader() {
        let lock = ReadWriteLock::new();
        let order = PlMutex::new(Vec::new());

        lock.lock_read();
        thread::scope(|s| {
            s.spawn(|| {
                lock.lock_write();
                order.lock().push("writer");
                lock.unlock(false);
            });
            wait_for("writer to queue", || lock.pending_writers() == Some(1));

            s.spawn(|| {
                lock.lock_read();
                order.lock().push("reader");
                lock.unlock(false);
            });

            thread::sleep(Duration::from_millis(50));
            assert!(order.lock().is_empty());
            lock.unlock(false);
        });

        assert_eq!(*order.lock(), vec!["writer", "reader"]);
    }

    #[test]
    fn test_reader_cannot_reenter_while_writer_pending() {
        let lock = ReadWriteLock::new();
        let written = AtomicBool::new(false);

        lock.lock_read();
        thread::scope(|s| {
            s.spawn(|| {
                lock.lock_write();
                written.store(true, Ordering::SeqCst);
                lock.unlock(false);
            });
            wait_for("writer to queue", || lock.pending_writers() == Some(1));

            assert!(!lock.try_lock_read());
            assert!(!written.load(Ordering::SeqCst));
            lock.unlock(false);
        });

        assert!(written.load(Ordering::SeqCst));
    }

    #[test]
    fn test_downgrade_admits_readers_only() {
        let lock = ReadWriteLock::new();
        lock.lock_write();
        lock.unlock(true);
        assert!(!lock.owns_write());
        assert_eq!(lock.readers(), 1);

        thread::scope(|s| {
            s.spawn(|| {
                assert!(lock.try_lock_read());
                lock.unlock(false);
                assert!(!lock.try_lock_write());
            });
        });

        lock.unlock(false);
        thread::scope(|s| {
            s.spawn(|| {
                assert!(lock.try_lock_write());
                lock.unlock(false);
            });
        });
    }

    #[test]
    fn test_guard_downgrade() {
        let lock = ReadWriteLock::new();
        let write = lock.write();
        let read = write.downgrade();
        assert!(!lock.owns_write());
        assert!(lock.try_write().is_none());
        drop(read);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_reader_unlock_with_exclusive_only_is_ignored() {
        let lock = ReadWriteLock::new();
        lock.lock_read();
        lock.unlock(true);
        assert_eq!(lock.readers(), 1);
        lock.unlock(false);
        assert_eq!(lock.readers(), 0);
    }

    #[test]
    fn test_last_reader_out_wakes_waiting_writer() {
        let lock = ReadWriteLock::new();
        let acquired = AtomicBool::new(false);

        lock.lock_read();
        thread::scope(|s| {
            s.spawn(|| {
                let _write = lock.write();
                acquired.store(true, Ordering::SeqCst);
            });
            wait_for("writer to queue", || lock.pending_writers() == Some(1));
            assert!(!acquired.load(Ordering::SeqCst));

            lock.unlock(false);
            wait_for("writer to take over", || acquired.load(Ordering::SeqCst));
        });
        assert_eq!(lock.readers(), 0);
        assert!(!lock.owns_write());
    }
}
