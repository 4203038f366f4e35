//! Re-entrant mutex on raw pthread primitives.
//!
//! A thread that already holds the lock may lock it again; the guard only
//! hands out shared access, so data that must change under the lock goes
//! in a `RefCell` (or other interior-mutable cell).

use libc::{pthread_mutex_t, pthread_mutexattr_t, PTHREAD_MUTEX_RECURSIVE};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::Deref;

pub struct RecursiveMutex<T> {
    // Boxed: a pthread mutex must not move once initialised.
    inner: Box<UnsafeCell<pthread_mutex_t>>,
    data: T,
}

// SAFETY: all access to `data` goes through a guard holding the pthread
// mutex, and the guard only yields `&T`. `T: Send` is required because the
// data may be reached from whichever thread holds the lock.
unsafe impl<T: Send> Send for RecursiveMutex<T> {}
unsafe impl<T: Send> Sync for RecursiveMutex<T> {}

impl<T> RecursiveMutex<T> {
    pub fn new(data: T) -> Self {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        unsafe {
            let mut attr: pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut attr);
            libc::pthread_mutexattr_settype(&mut attr, PTHREAD_MUTEX_RECURSIVE);
            libc::pthread_mutex_init(inner.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
        }
        Self { inner, data }
    }

    pub fn lock(&self) -> RecursiveMutexGuard<'_, T> {
        unsafe {
            libc::pthread_mutex_lock(self.inner.get());
        }
        RecursiveMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T: Default> Default for RecursiveMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Drop for RecursiveMutex<T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.inner.get());
        }
    }
}

/// Must be dropped on the thread that locked.
pub struct RecursiveMutexGuard<'a, T> {
    mutex: &'a RecursiveMutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for RecursiveMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.mutex.data
    }
}

impl<T> Drop for RecursiveMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.inner.get());
        }
    }
}
