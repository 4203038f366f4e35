//! # vrift-sync
//!
//! Locking primitives shared by the directory core:
//!
//! - [`ReadWriteLock`]: shared/exclusive lock with writer preference,
//!   recursive write ownership and downgrade.
//! - [`SpinMutex`]: busy-wait lock for contexts that must not park.
//! - [`RecursiveMutex`]: re-entrant mutex for registries whose callbacks
//!   call back into the registry.

pub mod recursive_mutex;
pub mod rwlock;
pub mod spin;
pub mod thread_id;

pub use recursive_mutex::{RecursiveMutex, RecursiveMutexGuard};
pub use rwlock::{ReadGuard, ReadWriteLock, WriteGuard};
pub use spin::{SpinGuard, SpinMutex};
