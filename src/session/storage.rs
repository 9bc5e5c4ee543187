//! Durable string-keyed storage backends.
//!
//! Both the session store and the aggregate cache persist through the same
//! [`Storage`] trait so tests can run against [`MemoryStorage`] while the
//! application uses [`FileStorage`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use directories::ProjectDirs;
use tokio::sync::RwLock;

use crate::{Error, Result};

/// Durable string-keyed storage.
///
/// `remove_many` must be atomic from the caller's perspective: no observer
/// may see one key removed while another still holds its old value.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn remove_many(&self, keys: &[&str]) -> Result<()>;
}

/// In-memory storage (for testing and single-instance use).
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

const APP_QUALIFIER: &str = "io";
const APP_ORG: &str = "fintrack";
const APP_NAME: &str = "fintrack";
const STORE_FILE: &str = "client-store.json";

/// File-backed storage holding all entries in one JSON document.
///
/// Every mutation rewrites the whole document under a single write lock, so
/// multi-key removals are atomic.
pub struct FileStorage {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileStorage {
    /// Storage under the platform data directory.
    pub fn new() -> Result<Self> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
            .ok_or_else(|| Error::storage("could not resolve a platform data directory"))?;
        Ok(Self::at_path(dirs.data_dir().join(STORE_FILE)))
    }

    /// Storage backed by an explicit file path.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_document(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::storage(format!("failed to read {}: {e}", self.path.display())))?;

        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // A corrupt store is unrecoverable state, not caller data.
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Discarding corrupt store file"
                );
                Ok(HashMap::new())
            }
        }
    }

    async fn write_document(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let content = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| Error::storage(format!("failed to write {}: {e}", self.path.display())))
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.read().await;
        Ok(self.read_document().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut entries = self.read_document().await?;
        entries.insert(key.to_string(), value.to_string());
        self.write_document(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.remove_many(&[key]).await
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut entries = self.read_document().await?;
        for key in keys {
            entries.remove(*key);
        }
        self.write_document(&entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let storage = MemoryStorage::new();
        storage.set("k", "v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));

        storage.remove("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_remove_many() {
        let storage = MemoryStorage::new();
        storage.set("a", "1").await.unwrap();
        storage.set("b", "2").await.unwrap();
        storage.set("c", "3").await.unwrap();

        storage.remove_many(&["a", "b"]).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
        assert_eq!(storage.get("b").await.unwrap(), None);
        assert_eq!(storage.get("c").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::at_path(dir.path().join("store.json"));

        storage.set("k", "v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));

        // A second instance at the same path sees the persisted value.
        let reopened = FileStorage::at_path(dir.path().join("store.json"));
        assert_eq!(reopened.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_file_corrupt_document_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let storage = FileStorage::at_path(&path);
        assert_eq!(storage.get("k").await.unwrap(), None);

        // Writes still work after discarding the corrupt document.
        storage.set("k", "v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
    }
}
