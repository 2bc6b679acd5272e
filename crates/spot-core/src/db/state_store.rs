//! Keyed scalar-state store (breaker flags, selector activations, open
//! positions, daily-loss counters).

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tracing::info;

use crate::Result;

/// Key-value store for JSON-serialized core state.
///
/// Keys are flat strings namespaced by component, e.g. `breaker:KRW-BTC`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Redis-backed store used in production.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: redis::aio::ConnectionManager,
    /// Prefix isolating this bot instance's keys.
    namespace: String,
}

impl RedisStateStore {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        let namespace = namespace.into();
        info!(namespace = %namespace, "Connected state store");
        Ok(Self { conn, namespace })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.full_key(key), value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.full_key(key)).await?;
        Ok(())
    }
}

/// In-memory store for tests and paper runs without infrastructure.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        store.put("breaker:KRW-BTC", "{\"is_open\":true}").await.unwrap();

        let loaded = store.get("breaker:KRW-BTC").await.unwrap();
        assert_eq!(loaded.as_deref(), Some("{\"is_open\":true}"));

        store.delete("breaker:KRW-BTC").await.unwrap();
        assert!(store.get("breaker:KRW-BTC").await.unwrap().is_none());
    }
}
