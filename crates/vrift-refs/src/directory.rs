//! Directories whose files the cleaner can reclaim.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::ref_counter::{IndexFileRefs, RefHandle};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid file name: {name:?}")]
    InvalidName { name: String },
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// A set of files plus the registry of which of them are in use.
pub trait Directory: Send + Sync {
    /// Delete `name`. Returns `false` if nothing was removed; calling it for
    /// a file that is already gone is harmless.
    fn remove(&self, name: &str) -> bool;

    /// References to this directory's files, owned by the directory.
    fn file_refs(&self) -> &IndexFileRefs;
}

/// Files under a root path, named by their `/`-separated relative path.
pub struct FsDirectory {
    root: PathBuf,
    refs: IndexFileRefs,
}

impl FsDirectory {
    /// Open (creating if needed) the directory at `root`.
    ///
    /// Files already present are registered with a count of zero, so a
    /// cleaner pass can reclaim the ones nobody reopens.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| DirectoryError::Io {
            path: root.clone(),
            source,
        })?;
        let directory = Self {
            root,
            refs: IndexFileRefs::new(),
        };
        for name in directory.list()? {
            drop(directory.refs.add(name.as_str()));
        }
        debug!(root = %directory.root.display(), files = directory.refs.len(), "Opened directory");
        Ok(directory)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or truncate) `name` and hold a reference to it while the
    /// returned file is alive.
    pub fn create_file(&self, name: &str) -> Result<TrackedFile> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| DirectoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(&path).map_err(|source| DirectoryError::Io { path, source })?;
        Ok(self.track(name, file))
    }

    /// Open `name` read-write and hold a reference to it while the returned
    /// file is alive.
    pub fn open_file(&self, name: &str) -> Result<TrackedFile> {
        let path = self.resolve(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| DirectoryError::Io { path, source })?;
        Ok(self.track(name, file))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_ok_and(|path| path.is_file())
    }

    /// Names of all regular files below the root, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                DirectoryError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let name: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect();
            names.push(name.join("/"));
        }
        names.sort();
        Ok(names)
    }

    fn track(&self, name: &str, file: File) -> TrackedFile {
        TrackedFile {
            file,
            handle: self.refs.add(name),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(DirectoryError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl Directory for FsDirectory {
    fn remove(&self, name: &str) -> bool {
        let path = match self.resolve(name) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Refusing to remove file");
                return false;
            }
        };
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "File already removed");
                false
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove file");
                false
            }
        }
    }

    fn file_refs(&self) -> &IndexFileRefs {
        &self.refs
    }
}

/// An open file that keeps its name referenced until dropped.
pub struct TrackedFile {
    file: File,
    handle: RefHandle<String>,
}

impl TrackedFile {
    pub fn name(&self) -> &str {
        &self.handle
    }

    /// Another reference to the same name, outliving this file if kept.
    pub fn handle(&self) -> RefHandle<String> {
        RefHandle::clone(&self.handle)
    }
}

impl Deref for TrackedFile {
    type Target = File;
    fn deref(&self) -> &File {
        &self.file
    }
}

impl DerefMut for TrackedFile {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

/// In-memory directory; records every `remove` call it receives.
#[derive(Default)]
pub struct MemoryDirectory {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    removals: Mutex<Vec<String>>,
    refs: IndexFileRefs,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `contents` under `name` and register it. The returned handle
    /// keeps the file in use until dropped.
    pub fn insert(&self, name: &str, contents: impl Into<Vec<u8>>) -> RefHandle<String> {
        self.files.lock().insert(name.to_string(), contents.into());
        self.refs.add(name)
    }

    pub fn read(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }

    /// Names passed to `remove`, in call order, whether or not they existed.
    pub fn removals(&self) -> Vec<String> {
        self.removals.lock().clone()
    }
}

impl Directory for MemoryDirectory {
    fn remove(&self, name: &str) -> bool {
        self.removals.lock().push(name.to_string());
        self.files.lock().remove(name).is_some()
    }

    fn file_refs(&self) -> &IndexFileRefs {
        &self.refs
    }
}
