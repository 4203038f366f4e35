//! Removal of unreferenced files.
//!
//! A pass walks the directory's [`IndexFileRefs`](crate::IndexFileRefs) with
//! unused-entry removal on. Files the acceptor wants kept are pinned for the
//! length of the pass so the walk does not drop their entries. Every other
//! file is deleted if nothing references it.
//!
//! Passes over the same directory must not overlap.

use tracing::{debug, trace};

use crate::directory::Directory;

/// Run one pass, deleting unreferenced files for which `acceptor` returns
/// `true`. Returns how many files were actually deleted.
pub fn clean<D>(directory: &D, mut acceptor: impl FnMut(&str) -> bool) -> usize
where
    D: Directory + ?Sized,
{
    let refs = directory.file_refs();
    let mut pinned = Vec::new();
    let mut removed = 0;

    refs.visit(
        |name, _| {
            if !acceptor(name) {
                pinned.push(refs.add(name.as_str()));
            } else if refs.find(name.as_str()) == 0 {
                if directory.remove(name) {
                    debug!(file = %name, "Removed unreferenced file");
                    removed += 1;
                } else {
                    trace!(file = %name, "Unreferenced file was not removed");
                }
            }
            true
        },
        true,
    );

    drop(pinned);
    removed
}

/// [`clean`] accepting every file.
pub fn clean_all<D>(directory: &D) -> usize
where
    D: Directory + ?Sized,
{
    clean(directory, |_| true)
}
