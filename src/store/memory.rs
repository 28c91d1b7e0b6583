//! In-memory store with lazy TTL expiry

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::{Store, StoreError, StoreResult};

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local [`Store`]. Expired keys are evicted on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deadline(ttl: Duration) -> StoreResult<Instant> {
        Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| StoreError::fatal(format!("ttl {ttl:?} is out of range")))
    }

    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(Self::deadline).transpose()?;
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        let existed = Self::live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.entries.lock();
        let current = Self::live(&mut entries, key)
            .and_then(|e| e.value.as_i64())
            .unwrap_or(0);
        let next = current.saturating_add(1);
        match entries.get_mut(key) {
            Some(e) => e.value = Value::from(next),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::from(next),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(e) => {
                e.expires_at = Some(Self::deadline(ttl)?);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
