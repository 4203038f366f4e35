use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use vrift_sync::ReadWriteLock;

use super::Resettable;

struct FreeList<T> {
    items: Vec<T>,
    /// Outstanding leases that were handed a pooled object or built while
    /// the pool had room.
    tracked: usize,
    /// Bumped by `clear`; leases from older generations are not taken back.
    generation: u64,
}

/// Never blocks on capacity: once `capacity` objects are out, further
/// leases get throwaway objects.
///
/// At most `capacity` objects are kept. Any returned object, throwaway or
/// not, is kept if the free list has room when it comes back.
///
/// Leasing and returning only take the free-list mutex. The
/// [`ReadWriteLock`] orders visits against each other and against `clear`.
pub struct UnboundedObjectPool<T> {
    capacity: usize,
    free: Mutex<FreeList<T>>,
    lock: ReadWriteLock,
}

impl<T: Resettable> UnboundedObjectPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(FreeList {
                items: Vec::with_capacity(capacity),
                tracked: 0,
                generation: 0,
            }),
            lock: ReadWriteLock::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lease a recycled object if one is free, otherwise build a new one.
    pub fn emplace(&self, args: T::Args) -> UnboundedLease<'_, T> {
        let (recycled, ticket) = {
            let mut free = self.free.lock();
            let mut ticket = Ticket {
                pool: self,
                tracked: false,
                generation: free.generation,
            };
            let recycled = free.items.pop();
            if recycled.is_some() || free.tracked < self.capacity {
                free.tracked += 1;
                ticket.tracked = true;
            }
            (recycled, ticket)
        };

        // Built outside the lock; `ticket` undoes the reservation on panic.
        let value = match recycled {
            Some(mut value) => {
                value.reset(args);
                value
            }
            None => T::make(args),
        };

        UnboundedLease {
            value: ManuallyDrop::new(value),
            ticket,
        }
    }

    /// Drop every pooled object. Leases still out stay valid and are
    /// discarded instead of pooled when returned.
    pub fn clear(&self) {
        let _guard = self.lock.write();
        let dropped = {
            let mut free = self.free.lock();
            free.generation += 1;
            free.tracked = 0;
            std::mem::take(&mut free.items)
        };
        drop(dropped);
    }

    /// Call `visitor` for every pooled, currently unleased object until it
    /// returns `false`. Returns `true` if every object was visited.
    ///
    /// Leased objects are never visited, so neither mode waits for leases.
    /// Exclusive visits exclude other visits and `clear`; shared visits only
    /// exclude exclusive ones and `clear`. Leasing and returning wait while
    /// the free list is walked. `visitor` must not use this pool.
    pub fn visit(&self, mut visitor: impl FnMut(&T) -> bool, exclusive: bool) -> bool {
        if exclusive {
            let _guard = self.lock.write();
            self.visit_free(&mut visitor)
        } else {
            let _guard = self.lock.read();
            self.visit_free(&mut visitor)
        }
    }

    fn visit_free(&self, visitor: &mut impl FnMut(&T) -> bool) -> bool {
        let free = self.free.lock();
        free.items.iter().all(|item| visitor(item))
    }

    fn recycle(&self, value: T, ticket: &mut Ticket<'_, T>) {
        let rejected = {
            let mut free = self.free.lock();
            if free.generation != ticket.generation {
                ticket.tracked = false;
                Some(value)
            } else {
                if ticket.tracked {
                    free.tracked -= 1;
                    ticket.tracked = false;
                }
                if free.items.len() < self.capacity {
                    free.items.push(value);
                    None
                } else {
                    Some(value)
                }
            }
        };
        drop(rejected);
    }
}

struct Ticket<'a, T> {
    pool: &'a UnboundedObjectPool<T>,
    tracked: bool,
    generation: u64,
}

impl<T> Drop for Ticket<'_, T> {
    fn drop(&mut self) {
        if self.tracked {
            let mut free = self.pool.free.lock();
            if free.generation == self.generation {
                free.tracked -= 1;
            }
        }
    }
}

/// Exclusive use of one object; pooled again (room permitting) on drop.
pub struct UnboundedLease<'a, T: Resettable> {
    value: ManuallyDrop<T>,
    ticket: Ticket<'a, T>,
}

impl<T: Resettable> UnboundedLease<'_, T> {
    /// Whether this lease holds one of the pool's `capacity` places.
    pub fn is_tracked(&self) -> bool {
        self.ticket.tracked
    }
}

impl<T: Resettable> Deref for UnboundedLease<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Resettable> DerefMut for UnboundedLease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Resettable> Drop for UnboundedLease<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `value` is taken exactly once, here, and never touched again.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        let pool = self.ticket.pool;
        pool.recycle(value, &mut self.ticket);
    }
}
