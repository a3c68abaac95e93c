//! Redis-backed ephemeral store (optional).
//!
//! Values are stored as JSON strings with `SET key value EX ttl`, so Redis
//! itself expires progress snapshots of crashed jobs.

use std::time::Duration;

use redis::aio::MultiplexedConnection;

use super::{EphemeralStore, EphemeralStoreError};

#[derive(Debug, Clone)]
pub struct RedisEphemeralStore {
    client: redis::Client,
    prefix: String,
}

impl RedisEphemeralStore {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, EphemeralStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| EphemeralStoreError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, EphemeralStoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EphemeralStoreError::Backend(e.to_string()))
    }
}

#[async_trait::async_trait]
impl EphemeralStore for RedisEphemeralStore {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), EphemeralStoreError> {
        let payload =
            serde_json::to_string(&value).map_err(|e| EphemeralStoreError::Serialize(e.to_string()))?;
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EphemeralStoreError::Backend(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EphemeralStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| EphemeralStoreError::Backend(e.to_string()))?;

        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| EphemeralStoreError::Serialize(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), EphemeralStoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EphemeralStoreError::Backend(e.to_string()))
    }
}
