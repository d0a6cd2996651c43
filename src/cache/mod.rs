use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub mod keys {
    use crate::time::RollingRange;
    use uuid::Uuid;

    pub const ANOMALIES_RECENT: &str = "anomalies:recent";
    pub const NODES_ALL: &str = "nodes:all";

    pub fn node_latest(node_id: Uuid) -> String {
        format!("node:{node_id}:latest")
    }

    pub fn node_metrics(node_id: Uuid, range: RollingRange) -> String {
        format!("node:{node_id}:metrics:{}", range.as_str())
    }

    pub fn system_metrics(range: RollingRange) -> String {
        format!("system:metrics:{}", range.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Hot-tier key-value store. Writes are last-write-wins with a bounded
/// TTL; there are no merge semantics.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn put(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn key_count(&self) -> Result<usize, CacheError>;
}

struct Entry {
    value: JsonValue,
    expires_at: Instant,
}

/// In-process hot cache. Expired entries are dropped lazily on access and
/// during `key_count`.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn put(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        entries.remove(key);
        Ok(())
    }

    async fn key_count(&self) -> Result<usize, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(entries.len())
    }
}
