//! Namespaced key/value storage behind the ledger.
//!
//! Every key holds one opaque value plus a revision counter. Writes carry
//! the revision the writer last read and fail with [`Error::Conflict`] if
//! another writer got there first, which gives the ledger compare-and-swap
//! semantics on any backend.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A stored value and the revision it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw value.
    pub value: Bytes,
    /// Starts at 1 and increases by one on every write.
    pub revision: u64,
}

/// Async key/value storage with per-key revisions.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a key. `Ok(None)` if it has never been written or was removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] or [`Error::Io`] if the backend
    /// cannot be reached.
    async fn read(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write a key if its current revision equals `expected`.
    ///
    /// `expected = None` means the key must not exist yet. Returns the new
    /// revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the stored revision differs.
    async fn write(&self, key: &str, value: Bytes, expected: Option<u64>) -> Result<u64>;

    /// Remove a key unconditionally. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    async fn remove(&self, key: &str) -> Result<()>;

    /// True if writes are shared with other devices.
    fn is_remote(&self) -> bool;
}

fn check_revision(key: &str, expected: Option<u64>, found: Option<u64>) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::Conflict {
            key: key.to_string(),
            expected,
            found,
        })
    }
}

/// In-memory backend.
///
/// Clones share the same map, so several ledgers built over clones of one
/// store behave like devices talking to the same shared service.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Versioned>>>,
    remote: bool,
}

impl MemoryStore {
    /// Store that reports itself as local-only.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    /// Store that reports itself as a shared remote service.
    #[must_use]
    pub fn remote() -> Self {
        Self {
            remote: true,
            ..Self::default()
        }
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, value: Bytes, expected: Option<u64>) -> Result<u64> {
        let mut entries = self.entries.lock();
        let found = entries.get(key).map(|v| v.revision);
        check_revision(key, expected, found)?;

        let revision = found.unwrap_or(0) + 1;
        entries.insert(key.to_string(), Versioned { value, revision });
        Ok(revision)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn is_remote(&self) -> bool {
        self.remote
    }
}

/// On-disk envelope for one key.
#[derive(Serialize, Deserialize)]
struct FileEntry {
    revision: u64,
    value: serde_json::Value,
}

/// Local-only backend keeping one JSON file per key.
///
/// Values must be JSON documents; they are embedded as-is so the files stay
/// readable. Revision checks are serialized within one process only.
pub struct FileStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!("Opened file store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Directory holding the key files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::Config(format!("invalid storage key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<FileEntry>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned>> {
        let Some(entry) = self.read_entry(key).await? else {
            return Ok(None);
        };
        Ok(Some(Versioned {
            value: Bytes::from(serde_json::to_vec(&entry.value)?),
            revision: entry.revision,
        }))
    }

    async fn write(&self, key: &str, value: Bytes, expected: Option<u64>) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let found = self.read_entry(key).await?.map(|e| e.revision);
        check_revision(key, expected, found)?;

        let entry = FileEntry {
            revision: found.unwrap_or(0) + 1,
            value: serde_json::from_slice(&value)?,
        };
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(entry.revision)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_remote(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_revisions() {
        let store = MemoryStore::local();
        assert!(store.read("k").await.expect("read").is_none());

        let r1 = store
            .write("k", Bytes::from_static(b"1"), None)
            .await
            .expect("first write");
        assert_eq!(r1, 1);

        let r2 = store
            .write("k", Bytes::from_static(b"2"), Some(1))
            .await
            .expect("second write");
        assert_eq!(r2, 2);

        let stored = store.read("k").await.expect("read").expect("present");
        assert_eq!(stored.value, Bytes::from_static(b"2"));
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn test_memory_store_stale_write_conflicts() {
        let store = MemoryStore::local();
        store
            .write("k", Bytes::from_static(b"1"), None)
            .await
            .expect("write");

        let stale = store.write("k", Bytes::from_static(b"x"), None).await;
        assert!(matches!(
            stale,
            Err(Error::Conflict {
                expected: None,
                found: Some(1),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_clones_share_state() {
        let a = MemoryStore::remote();
        let b = a.clone();
        a.write("k", Bytes::from_static(b"1"), None)
            .await
            .expect("write");

        assert!(b.read("k").await.expect("read").is_some());
        assert!(b.is_remote());
        assert!(!MemoryStore::local().is_remote());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = FileStore::open(dir.path()).expect("open");
            store
                .write("transactions", Bytes::from_static(br#"[{"id":"TXN-1"}]"#), None)
                .await
                .expect("write");
        }

        let reopened = FileStore::open(dir.path()).expect("reopen");
        let stored = reopened
            .read("transactions")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(stored.revision, 1);
        let value: serde_json::Value = serde_json::from_slice(&stored.value).expect("json");
        assert_eq!(value[0]["id"], "TXN-1");
        assert!(!reopened.is_remote());
    }

    #[tokio::test]
    async fn test_file_store_conflict_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        store
            .write("current_session", Bytes::from_static(b"{}"), None)
            .await
            .expect("write");

        let stale = store
            .write("current_session", Bytes::from_static(b"{}"), None)
            .await;
        assert!(matches!(stale, Err(Error::Conflict { .. })));

        store.remove("current_session").await.expect("remove");
        store.remove("current_session").await.expect("remove twice");
        assert!(store.read("current_session").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        assert!(store.read("../escape").await.is_err());
    }
}
