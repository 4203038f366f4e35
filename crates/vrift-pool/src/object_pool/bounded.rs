use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, MappedRwLockWriteGuard, Mutex, RwLock, RwLockWriteGuard};
use vrift_sync::ReadWriteLock;

use super::Resettable;

/// Fixed number of slots; `emplace` blocks while all of them are leased.
///
/// A slot's object is built once and then reset in place for every later
/// lease, so it keeps its address for the life of the pool.
pub struct BoundedObjectPool<T> {
    slots: Box<[RwLock<Option<T>>]>,
    free: Mutex<Vec<usize>>,
    available: Condvar,
    lock: ReadWriteLock,
}

impl<T: Resettable> BoundedObjectPool<T> {
    /// A pool of `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| RwLock::new(None)).collect(),
            free: Mutex::new((0..capacity).rev().collect()),
            available: Condvar::new(),
            lock: ReadWriteLock::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Lease an object, blocking until a slot is free.
    pub fn emplace(&self, args: T::Args) -> BoundedLease<'_, T> {
        self.lock.lock_read();
        let index = {
            let mut free = self.free.lock();
            loop {
                if let Some(index) = free.pop() {
                    break index;
                }
                self.available.wait(&mut free);
            }
        };
        // Returns the slot if building the object panics.
        let slot = SlotTicket { pool: self, index };

        let value = RwLockWriteGuard::map(self.slots[index].write(), |slot| match slot.take() {
            Some(mut value) => {
                value.reset(args);
                slot.insert(value)
            }
            None => slot.insert(T::make(args)),
        });

        BoundedLease { value, _slot: slot }
    }

    /// Call `visitor` for every constructed object until it returns `false`.
    /// Returns `true` if no call returned `false`.
    ///
    /// Exclusive visits wait for all leases to be returned and hold off new
    /// ones, so they see every object. While one is waiting, `emplace` waits
    /// too: a thread must not lease again while it holds a lease and another
    /// thread may be visiting exclusively.
    ///
    /// Shared visits run alongside leasing and skip objects that are leased
    /// at the moment their slot is reached. Either way `visitor` must not
    /// lease from this pool.
    pub fn visit(&self, mut visitor: impl FnMut(&T) -> bool, exclusive: bool) -> bool {
        if exclusive {
            let _guard = self.lock.write();
            self.slots
                .iter()
                .all(|slot| slot.read().as_ref().map_or(true, &mut visitor))
        } else {
            self.slots.iter().all(|slot| {
                slot.try_read()
                    .and_then(|slot| slot.as_ref().map(&mut visitor))
                    .unwrap_or(true)
            })
        }
    }
}

struct SlotTicket<'a, T> {
    pool: &'a BoundedObjectPool<T>,
    index: usize,
}

impl<T> Drop for SlotTicket<'_, T> {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.index);
        self.pool.available.notify_one();
        self.pool.lock.unlock(false);
    }
}

/// Exclusive use of one pooled object.
pub struct BoundedLease<'a, T> {
    // Field order matters: release the slot before handing it back.
    value: MappedRwLockWriteGuard<'a, T>,
    _slot: SlotTicket<'a, T>,
}

impl<T> Deref for BoundedLease<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for BoundedLease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Codec {
        id: usize,
        resets: usize,
    }

    impl Resettable for Codec {
        type Args = usize;

        fn make(id: usize) -> Self {
            Self { id, resets: 0 }
        }

        fn reset(&mut self, id: usize) {
            self.id = id;
            self.resets += 1;
        }
    }

    #[test]
    fn test_slot_is_reused_in_place() {
        let pool = BoundedObjectPool::<Codec>::new(1);

        let first = pool.emplace(1);
        let addr = &*first as *const Codec;
        assert_eq!(first.id, 1);
        drop(first);

        let second = pool.emplace(2);
        assert_eq!(&*second as *const Codec, addr);
        assert_eq!(second.id, 2);
        assert_eq!(second.resets, 1);
    }

    #[test]
    fn test_emplace_blocks_at_capacity() {
        let pool = BoundedObjectPool::<Vec<u8>>::new(1);
        let leased = AtomicBool::new(false);

        let mut lease = pool.emplace(16);
        lease.extend_from_slice(b"held");

        thread::scope(|s| {
            s.spawn(|| {
                let lease = pool.emplace(8);
                assert!(lease.is_empty());
                leased.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!leased.load(Ordering::SeqCst));
            drop(lease);
        });

        assert!(leased.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_leases_never_share_a_slot() {
        let pool = BoundedObjectPool::<Vec<u8>>::new(3);
        thread::scope(|s| {
            for i in 0..6u8 {
                let pool = &pool;
                s.spawn(move || {
                    for _ in 0..100 {
                        let mut lease = pool.emplace(4);
                        assert!(lease.is_empty());
                        lease.push(i);
                        thread::yield_now();
                        assert_eq!(lease.as_slice(), &[i]);
                    }
                });
            }
        });

        let mut seen = 0;
        assert!(pool.visit(
            |_| {
                seen += 1;
                true
            },
            true
        ));
        assert!(seen <= pool.capacity());
    }

    #[test]
    fn test_exclusive_visit_waits_for_leases() {
        let pool = BoundedObjectPool::<Codec>::new(2);
        let visited = AtomicBool::new(false);

        let lease = pool.emplace(7);
        thread::scope(|s| {
            s.spawn(|| {
                let mut ids = Vec::new();
                assert!(pool.visit(
                    |codec| {
                        ids.push(codec.id);
                        true
                    },
                    true
                ));
                assert_eq!(ids, vec![7]);
                visited.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!visited.load(Ordering::SeqCst));
            drop(lease);
        });
        assert!(visited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_visit_stops_early() {
        let pool = BoundedObjectPool::<Codec>::new(3);
        drop((pool.emplace(1), pool.emplace(2), pool.emplace(3)));

        let mut calls = 0;
        assert!(!pool.visit(
            |_| {
                calls += 1;
                false
            },
            false
        ));
        assert_eq!(calls, 1);

        let mut total = 0;
        assert!(pool.visit(
            |codec| {
                total += codec.id;
                true
            },
            false
        ));
        assert_eq!(total, 6);
    }

    #[test]
    fn test_panicking_constructor_returns_slot() {
        struct Fragile;
        impl Resettable for Fragile {
            type Args = bool;
            fn make(fail: bool) -> Self {
                assert!(!fail, "construction failed");
                Fragile
            }
            fn reset(&mut self, _: bool) {}
        }

        let pool = BoundedObjectPool::<Fragile>::new(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _lease = pool.emplace(true);
        }));
        assert!(result.is_err());

        drop(pool.emplace(false));
        let mut built = 0;
        assert!(pool.visit(
            |_| {
                built += 1;
                true
            },
            true
        ));
        assert_eq!(built, 1);
    }

    #[test]
    fn test_shared_visit_skips_leased_slots() {
        let pool = BoundedObjectPool::<Codec>::new(3);
        drop((pool.emplace(1), pool.emplace(2)));

        let held = pool.emplace(5);
        let mut ids = Vec::new();
        assert!(pool.visit(
            |codec| {
                ids.push(codec.id);
                true
            },
            false
        ));
        assert_eq!(ids.len(), 1);
        assert_ne!(ids, vec![held.id]);
        drop(held);

        let mut count = 0;
        assert!(pool.visit(
            |_| {
                count += 1;
                true
            },
            false
        ));
        assert_eq!(count, 2);
    }

    #[test]
    fn test_pending_exclusive_visit_holds_off_new_leases() {
        let pool = BoundedObjectPool::<Codec>::new(2);
        let order = Mutex::new(Vec::new());

        let lease = pool.emplace(1);
        thread::scope(|s| {
            s.spawn(|| {
                pool.visit(
                    |_| {
                        order.lock().push("visit");
                        true
                    },
                    true,
                );
            });
            wait_for("exclusive visit to queue", || pool.lock.pending_writers() == Some(1));

            s.spawn(|| {
                let _second = pool.emplace(2);
                order.lock().push("emplace");
            });
            thread::sleep(Duration::from_millis(50));
            assert!(order.lock().is_empty());
            drop(lease);
        });

        assert_eq!(*order.lock(), vec!["visit", "emplace"]);
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
