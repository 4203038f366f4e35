//! # vrift-pool
//!
//! Background workers and object recycling for the directory core.
//!
//! Maintenance work (flushes, merges, cleaner passes) goes to a
//! [`ThreadPool`], either one the embedder owns or the process-wide
//! [`global`] pool. Scratch objects are borrowed from a
//! [`BoundedObjectPool`] or [`UnboundedObjectPool`].

pub mod object_pool;
pub mod thread_pool;

use once_cell::sync::Lazy;

pub use object_pool::{
    BoundedLease, BoundedObjectPool, Resettable, UnboundedLease, UnboundedObjectPool,
};
pub use thread_pool::ThreadPool;

static GLOBAL: Lazy<ThreadPool> =
    Lazy::new(|| ThreadPool::from_config(&vrift_config::global().thread_pool));

/// Process-wide pool, built from [`vrift_config::global`] on first use.
///
/// Statics are never dropped, so this pool is only stopped by an explicit
/// [`ThreadPool::stop`].
pub fn global() -> &'static ThreadPool {
    &GLOBAL
}
