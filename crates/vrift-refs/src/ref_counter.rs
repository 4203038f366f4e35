//! Registry of shared handles keyed by value.
//!
//! The registry keeps one reference to every entry, so the count it reports
//! is the number of handles held outside it. An entry whose count falls to
//! zero stays registered until [`RefCounter::remove`] or a
//! [`RefCounter::visit`] pass with `remove_unused` drops it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use vrift_sync::RecursiveMutex;

/// A registered key. Cloning it is one more holder.
pub type RefHandle<K> = Arc<K>;

pub struct RefCounter<K> {
    // Recursive so that `visit` callbacks may use the registry.
    entries: RecursiveMutex<RefCell<HashMap<K, RefHandle<K>>>>,
}

/// Names of index files in use, per directory.
pub type IndexFileRefs = RefCounter<String>;

impl<K: Hash + Eq + Clone> RefCounter<K> {
    pub fn new() -> Self {
        Self {
            entries: RecursiveMutex::new(RefCell::new(HashMap::new())),
        }
    }

    /// Handle to the entry equal to `key`, registering it if absent.
    ///
    /// There is no empty handle: if building the key panics, the panic
    /// reaches the caller. The key is built before anything is inserted, so
    /// the registry is left unchanged.
    pub fn add<Q>(&self, key: &Q) -> RefHandle<K>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let entries = self.entries.lock();
        if let Some(handle) = entries.borrow().get(key) {
            return Arc::clone(handle);
        }

        let owned = key.to_owned();
        let handle = Arc::new(owned.clone());
        entries.borrow_mut().insert(owned, Arc::clone(&handle));
        handle
    }

    /// Unregister `key` even if handles to it are still held; those stay
    /// valid, and the next `add` registers a fresh entry.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entries = self.entries.lock();
        let removed = entries.borrow_mut().remove(key);
        removed.is_some()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entries = self.entries.lock();
        let found = entries.borrow().contains_key(key);
        found
    }

    /// Handles held outside the registry, `0` if `key` is not registered.
    pub fn find<Q>(&self, key: &Q) -> usize
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entries = self.entries.lock();
        let count = entries.borrow().get(key).map_or(0, held_outside);
        count
    }

    pub fn is_empty(&self) -> bool {
        let entries = self.entries.lock();
        let empty = entries.borrow().is_empty();
        empty
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        let len = entries.borrow().len();
        len
    }

    /// Call `visitor(key, count)` for every entry registered when the pass
    /// starts, until it returns `false`. With `remove_unused`, an entry
    /// whose count is zero once its visitor call returns is unregistered.
    ///
    /// The registry stays locked against other threads for the whole pass,
    /// but `visitor` may call back into it. Entries it removes are skipped,
    /// entries it adds are not visited. Returns `true` if no call returned
    /// `false`.
    pub fn visit(&self, mut visitor: impl FnMut(&K, usize) -> bool, remove_unused: bool) -> bool {
        let entries = self.entries.lock();
        let keys: Vec<K> = entries.borrow().keys().cloned().collect();

        for key in keys {
            let count = match entries.borrow().get(&key) {
                Some(handle) => held_outside(handle),
                None => continue,
            };
            if !visitor(&key, count) {
                return false;
            }
            if remove_unused {
                let mut map = entries.borrow_mut();
                if map.get(&key).is_some_and(|handle| held_outside(handle) == 0) {
                    map.remove(&key);
                }
            }
        }
        true
    }
}

impl<K: Hash + Eq + Clone> Default for RefCounter<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn held_outside<K>(handle: &RefHandle<K>) -> usize {
    Arc::strong_count(handle) - 1
}
