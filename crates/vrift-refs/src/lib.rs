//! # vrift-refs
//!
//! Tracks which files of a directory are in use and deletes the ones that
//! are not.
//!
//! Every open file holds a handle from the directory's [`IndexFileRefs`].
//! [`directory_cleaner::clean`] deletes files nobody holds, subject to a
//! caller policy, and [`PeriodicCleaner`] repeats that on a thread pool.

pub mod directory;
pub mod directory_cleaner;
pub mod periodic;
pub mod ref_counter;

pub use directory::{Directory, DirectoryError, FsDirectory, MemoryDirectory, Result, TrackedFile};
pub use periodic::PeriodicCleaner;
pub use ref_counter::{IndexFileRefs, RefCounter, RefHandle};
