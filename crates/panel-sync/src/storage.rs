//! Synchronous key/value storage abstraction for local durable state.
//!
//! Shaped after the browser's `localStorage`: string keys, string values,
//! synchronous calls. Synchronous writes are what make the page-hide backstop
//! possible, since nothing async is guaranteed to finish during unload.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - `FileStore` - One JSON file per key in a directory (native only)
//! - `JsLocalStorage` (in panel-sync-wasm) - Calls into `window.localStorage`

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Local key/value store.
pub trait LocalStore {
    /// Read a value. `Ok(None)` if the key is absent.
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-memory store for testing
#[derive(Default)]
pub struct InMemoryStore {
    items: RwLock<HashMap<String, String>>,
    /// When set, every write fails as if the quota were exhausted
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a full storage quota.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalStore for InMemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::QuotaExceeded(key.to_string()));
        }
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.remove(key);
        Ok(())
    }
}

// Share one store between the sessions of every open document
impl<T: LocalStore + ?Sized> LocalStore for std::sync::Arc<T> {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        (**self).get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        (**self).set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key)
    }
}

impl<T: LocalStore + ?Sized> LocalStore for std::rc::Rc<T> {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        (**self).get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        (**self).set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key)
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use file_store::FileStore;

#[cfg(not(target_arch = "wasm32"))]
mod file_store {
    use super::{LocalStore, Result, StorageError};
    use std::fs;
    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};

    /// Directory-backed store: each key is a `.json` file.
    ///
    /// Keys are sanitized into file names, so keys differing only in
    /// characters outside `[A-Za-z0-9_-]` may collide. Document keys are built
    /// from ids and never do.
    pub struct FileStore {
        dir: PathBuf,
    }

    impl FileStore {
        /// Create the store, creating `dir` if it does not exist.
        pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
            let dir = dir.as_ref().to_path_buf();
            fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
            Ok(Self { dir })
        }

        fn path_for(&self, key: &str) -> PathBuf {
            let name: String = key
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            self.dir.join(format!("{}.json", name))
        }
    }

    impl LocalStore for FileStore {
        fn get_item(&self, key: &str) -> Result<Option<String>> {
            match fs::read_to_string(self.path_for(key)) {
                Ok(contents) => Ok(Some(contents)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StorageError::Io(e.to_string())),
            }
        }

        fn set_item(&self, key: &str, value: &str) -> Result<()> {
            // Write to a sibling file first so a crash never leaves half a record
            let path = self.path_for(key);
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, value).map_err(|e| StorageError::Io(e.to_string()))?;
            fs::rename(&tmp, &path).map_err(|e| StorageError::Io(e.to_string()))
        }

        fn remove_item(&self, key: &str) -> Result<()> {
            match fs::remove_file(self.path_for(key)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e.to_string())),
            }
        }
    }
}
