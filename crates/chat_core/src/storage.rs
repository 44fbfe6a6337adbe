//! Key/value persistence used for the offline queue and stats.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Result, StorageError};

/// String-keyed persistence collaborator.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value; `None` when the key was never written.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`.
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;
}

/// Load and decode a JSON value, falling back to `T::default()` when the key
/// is missing or holds data that no longer decodes.
pub async fn load_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(raw) = store.get_item(key).await? else {
        return Ok(T::default());
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            log::warn!("Discarding undecodable value under {key}: {err}");
            Ok(T::default())
        }
    }
}

pub async fn save_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    store.set_item(key, &raw).await
}

/// File-based store: one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    base_path: PathBuf,
}

impl FileKeyValueStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn item_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.item_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path).await?))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.item_path(key)?;
        fs::create_dir_all(&self.base_path).await?;

        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let path = self.item_path(key)?;
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.write().await.remove(key);
        Ok(())
    }
}
