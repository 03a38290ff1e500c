use super::{LocalNamespace, StorageBackend, StorageTier};
use crate::core::{IdentityError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

/// Durable key/value store kept as one JSON object on disk.
///
/// Serves as the structured-database tier and, for the CLI, as a file-backed
/// local namespace. Every mutation rewrites the file through a temp file in the
/// same directory followed by an atomic rename.
pub struct JsonFileStore {
    name: String,
    tier: StorageTier,
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Opens (or lazily creates) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_as(path, "structured_database", StorageTier::StructuredDatabase)
    }

    pub fn open_as<P: AsRef<Path>>(path: P, name: &str, tier: StorageTier) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::load(&path)?;
        Ok(Self {
            name: name.to_string(),
            tier,
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(path).map_err(|e| {
            IdentityError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| {
            IdentityError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn write_atomic(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| {
            IdentityError::storage(&self.name, format!("Failed to create directory: {}", e))
        })?;

        let serialized = serde_json::to_vec_pretty(entries)?;
        let mut temp = NamedTempFile::new_in(&dir).map_err(|e| {
            IdentityError::storage(&self.name, format!("Failed to create temp file: {}", e))
        })?;
        temp.write_all(&serialized).map_err(|e| {
            IdentityError::storage(&self.name, format!("Failed to write temp file: {}", e))
        })?;
        temp.as_file().sync_all().map_err(|e| {
            IdentityError::storage(&self.name, format!("Failed to sync temp file: {}", e))
        })?;
        temp.persist(&self.path).map_err(|e| {
            IdentityError::storage(&self.name, format!("Failed to replace store file: {}", e))
        })?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(err) = self.write_atomic(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.remove(key) {
            if let Err(err) = self.write_atomic(&entries) {
                entries.insert(key.to_string(), old);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for JsonFileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StorageTier {
        self.tier
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }
}

#[async_trait]
impl LocalNamespace for JsonFileStore {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            StorageBackend::set(&store, "device_user_id", "fp_abc").await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            StorageBackend::get(&reopened, "device_user_id").await.unwrap(),
            Some("fp_abc".to_string())
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(IdentityError::Serialization(_))
        ));
    }
}
