//! In-memory TTL store for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use super::{EphemeralStore, EphemeralStoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-memory ephemeral store.
///
/// Expired entries are invisible to `get`. They are physically removed by
/// `purge_expired`, and by `put` when it adds a new key to a map already
/// holding `sweep_above` entries.
/// Uses `tokio::time::Instant`, so paused-clock tests can advance past TTLs.
#[derive(Debug)]
pub struct InMemoryEphemeralStore {
    entries: RwLock<HashMap<String, Entry>>,
    sweep_above: usize,
}

impl Default for InMemoryEphemeralStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sweep_above: 256,
        }
    }
}

impl InMemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_above(mut self, entries: usize) -> Self {
        self.sweep_above = entries;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Remaining time-to-live of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        let now = Instant::now();
        (entry.expires_at > now).then(|| entry.expires_at - now)
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

#[async_trait::async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), EphemeralStoreError> {
        let mut entries = self.entries.write().map_err(|_| EphemeralStoreError::Poisoned)?;
        let now = Instant::now();
        if entries.len() >= self.sweep_above && !entries.contains_key(key) {
            entries.retain(|_, e| e.expires_at > now);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EphemeralStoreError> {
        let entries = self.entries.read().map_err(|_| EphemeralStoreError::Poisoned)?;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), EphemeralStoreError> {
        let mut entries = self.entries.write().map_err(|_| EphemeralStoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}
