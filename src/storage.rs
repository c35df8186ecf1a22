//! Persistent key-value collaborator.
//!
//! The host application provides durable storage; this subsystem only needs
//! get/set/remove by string key for the identity, seen-id set, relay queue,
//! contact records, and group records.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// String-keyed persistence boundary between the mesh subsystem and whatever
/// the host platform uses for durable storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store used by tests and by hosts that opt out of persistence.
/// State does not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("identity:v1", "{}").await.unwrap();
        assert_eq!(store.get("identity:v1").await.unwrap().as_deref(), Some("{}"));

        store.remove("identity:v1").await.unwrap();
        assert_eq!(store.get("identity:v1").await.unwrap(), None);
    }
}
