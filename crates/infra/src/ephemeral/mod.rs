//! Ephemeral key/value storage with time-to-live.
//!
//! Progress snapshots live here rather than in the durable record store: they
//! are written after every chunk and must disappear on their own when the
//! job that wrote them crashes.

use std::time::Duration;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use in_memory::InMemoryEphemeralStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisEphemeralStore;

/// Ephemeral store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EphemeralStoreError {
    #[error("ephemeral store backend error: {0}")]
    Backend(String),
    #[error("failed to (de)serialize ephemeral value: {0}")]
    Serialize(String),
    #[error("ephemeral store lock poisoned")]
    Poisoned,
}

/// TTL-bounded key/value store shared by every worker.
///
/// Implementations must be safe for concurrent use across unrelated jobs.
/// Writing a key replaces its value and its TTL.
#[async_trait::async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), EphemeralStoreError>;

    /// Returns `None` for missing or expired keys.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EphemeralStoreError>;

    async fn delete(&self, key: &str) -> Result<(), EphemeralStoreError>;
}
