//! In-memory key/value storage.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use relay_core::{Clock, MemoryEntry, MemoryStore, StorageError, SystemClock};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    created_at: i64,
    expires_at: Option<i64>,
}

impl StoredValue {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

type Namespaces = HashMap<String, HashMap<String, StoredValue>>;

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart. Expired entries are hidden on read and
/// dropped on the next write to their namespace.
#[derive(Debug)]
pub struct InMemoryStore {
    namespaces: RwLock<Namespaces>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store with an explicit time source.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Internal(e.to_string())
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let now = self.clock.now_millis();
        Ok(self
            .namespaces
            .read()
            .map_err(lock_error)?
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: String,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        let now = self.clock.now_millis();
        let expires_at = ttl_secs.map(|ttl| {
            let ttl_ms = i64::try_from(ttl.saturating_mul(1000)).unwrap_or(i64::MAX);
            now.saturating_add(ttl_ms)
        });

        let mut namespaces = self.namespaces.write().map_err(lock_error)?;
        let entries = namespaces.entry(namespace.to_owned()).or_default();
        entries.retain(|_, v| v.is_live(now));
        entries.insert(
            key.to_owned(),
            StoredValue {
                value,
                created_at: now,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let now = self.clock.now_millis();
        let mut namespaces = self.namespaces.write().map_err(lock_error)?;
        let Some(entries) = namespaces.get_mut(namespace) else {
            return Ok(false);
        };
        let removed = entries.remove(key).is_some_and(|v| v.is_live(now));
        if entries.is_empty() {
            namespaces.remove(namespace);
        }
        Ok(removed)
    }

    async fn list(
        &self,
        namespace: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, StorageError> {
        let now = self.clock.now_millis();
        let namespaces = self.namespaces.read().map_err(lock_error)?;
        let Some(entries) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut result: Vec<MemoryEntry> = entries
            .iter()
            .filter(|(key, v)| v.is_live(now) && prefix.is_none_or(|p| key.starts_with(p)))
            .map(|(key, v)| MemoryEntry {
                key: key.clone(),
                value: v.value.clone(),
                created_at: v.created_at,
            })
            .collect();

        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }
}
