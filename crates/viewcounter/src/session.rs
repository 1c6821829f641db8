//! Session-scoped view deduplication.
//!
//! A [`SessionGate`] remembers whether the current browsing session has
//! already counted a view. The flag lives in a [`SessionStorage`] backend
//! whose lifetime is the session: it survives re-mounts of the counter but
//! not the end of the session. Storage failures never break the page; the
//! gate fails open and reports "not counted", accepting an occasional extra
//! view.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Storage key of the counted flag.
pub const VIEW_COUNTED_KEY: &str = "view-counted";

const COUNTED: &str = "true";

/// Key/value storage scoped to one session.
pub trait SessionStorage: Send + Sync + fmt::Debug {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the storage cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the storage cannot be written.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Session storage that lives as long as the value (and its clones).
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStorage {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySessionStorage {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| Error::storage_unavailable("session lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| Error::storage_unavailable("session lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| Error::storage_unavailable("session lock poisoned"))?;
        values.remove(key);
        Ok(())
    }
}

/// Session storage kept in a JSON file, one file per session id.
///
/// The file name is derived from a BLAKE3 hash of the session id, so any
/// string works as an id. [`FileSessionStorage::end`] deletes the file,
/// which is what ends the session.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    /// Open the storage for `session_id` under `dir`.
    ///
    /// The directory is created on first write, not here.
    #[must_use]
    pub fn open(dir: impl AsRef<Path>, session_id: &str) -> Self {
        let digest = blake3::hash(session_id.as_bytes()).to_hex();
        let path = dir.as_ref().join(format!("{}.json", &digest.as_str()[..32]));
        Self { path }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End the session, discarding everything it stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn end(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Session ended");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage_unavailable(format!(
                "cannot remove {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                Error::storage_unavailable(format!("corrupt session file {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::storage_unavailable(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::storage_unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let text = serde_json::to_string(values)?;
        std::fs::write(&self.path, text).map_err(|e| {
            Error::storage_unavailable(format!("cannot write {}: {e}", self.path.display()))
        })
    }
}

impl SessionStorage for FileSessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.load()?;
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}

/// Answers "has this session already counted a view of this page?".
#[derive(Debug, Clone)]
pub struct SessionGate {
    storage: Arc<dyn SessionStorage>,
    key: String,
}

impl SessionGate {
    /// Create a gate for `page_id` over the given session storage.
    #[must_use]
    pub fn new(storage: Arc<dyn SessionStorage>, page_id: &str) -> Self {
        Self {
            storage,
            key: format!("{VIEW_COUNTED_KEY}:{page_id}"),
        }
    }

    /// Create a gate backed by a fresh in-memory session.
    #[must_use]
    pub fn in_memory(page_id: &str) -> Self {
        Self::new(Arc::new(MemorySessionStorage::new()), page_id)
    }

    /// Whether this session has already counted. Fails open.
    #[must_use]
    pub fn has_counted(&self) -> bool {
        match self.storage.get(&self.key) {
            Ok(value) => value.as_deref() == Some(COUNTED),
            Err(err) => {
                warn!(error = %err, "Session storage unreadable, treating as not counted");
                false
            }
        }
    }

    /// Record that this session has counted. Idempotent.
    pub fn mark_counted(&self) {
        if let Err(err) = self.storage.set(&self.key, COUNTED) {
            warn!(error = %err, "Could not persist counted flag");
        }
    }

    /// Clear the flag so a fresh dwell attempt may count again.
    pub fn reset(&self) {
        if let Err(err) = self.storage.remove(&self.key) {
            warn!(error = %err, "Could not clear counted flag");
        }
    }
}
