//! Recycling pools for objects that are expensive to build.
//!
//! Both pools hand out leases that put the object back when dropped, and
//! both order visits through a [`vrift_sync::ReadWriteLock`]. In the bounded
//! pool every lease holds it shared, so an exclusive visit waits for all
//! leases to come back. The unbounded pool only visits free objects and
//! never makes leasing wait on it.

mod bounded;
mod unbounded;

pub use bounded::{BoundedLease, BoundedObjectPool};
pub use unbounded::{UnboundedLease, UnboundedObjectPool};

/// Objects a pool can build and later recycle in place.
pub trait Resettable {
    type Args;

    /// Build a fresh object.
    fn make(args: Self::Args) -> Self;

    /// Reinitialise a recycled object as if `make(args)` had built it.
    fn reset(&mut self, args: Self::Args);
}

/// Scratch byte buffers; `Args` is the capacity needed.
impl Resettable for Vec<u8> {
    type Args = usize;

    fn make(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }

    fn reset(&mut self, capacity: usize) {
        self.clear();
        self.reserve(capacity);
    }
}
