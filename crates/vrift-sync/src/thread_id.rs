//! Logical thread identifiers.
//!
//! Lock ownership is recorded as a plain `u64` so it fits in a single atomic.
//! Ids start at 1; [`NO_THREAD`] marks an unowned lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel stored in ownership words while nobody holds the lock.
pub const NO_THREAD: u64 = 0;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

/// Id of the calling thread. Stable for the thread's lifetime, never reused.
#[inline]
pub fn current() -> u64 {
    CURRENT.with(|id| *id)
}
