mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{StoreError, StoreResult};

pub use sqlite::SqliteStore;

pub const SNAPSHOT_KEY: &str = "monitor:status:latest";
pub const HISTORY_PREFIX: &str = "history:";

pub fn history_key(monitor_id: &str) -> String {
    format!("{}{}", HISTORY_PREFIX, monitor_id)
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Returns `None` for missing keys and for keys past their expiry.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Overwrites any previous value. `ttl` of `None` never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    /// Deleting a missing key is a no-op.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Deletes only while the stored value still equals `expected`. Returns
    /// whether a row was removed.
    async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now <= at)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Utc::now();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Utc::now() + ttl);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|entry| entry.value == expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Utc::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Builds the backend named by the configuration.
pub fn open(config: &StorageConfig) -> StoreResult<Arc<dyn Store>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Storage: in-process memory (state is lost on restart)");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            let path = config.path.as_ref().ok_or_else(|| {
                StoreError::NotConfigured("storage.path is required for the sqlite backend".into())
            })?;
            info!("Storage: sqlite at {}", path.display());
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}
