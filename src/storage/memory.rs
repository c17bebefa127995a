//! In-memory storage backend

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::trace;

use crate::dht::key::Key;
use crate::storage::backend::{Storage, StoredValue};
use anyhow::Result;

/// Process-local storage; contents are lost on shutdown
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    values: RwLock<HashMap<Key, StoredValue>>,
}

impl InMemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn contains(&self, key: &Key) -> Result<bool> {
        Ok(self.values.read().await.contains_key(key))
    }

    async fn get(&self, key: &Key) -> Result<Option<StoredValue>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: Key, content: String) -> Result<()> {
        trace!("Storing {} bytes under {}", content.len(), key);
        self.values.write().await.insert(key, StoredValue::new(content));
        Ok(())
    }

    async fn keys_stale_since(&self, window: Duration) -> Result<Vec<Key>> {
        let now = SystemTime::now();
        Ok(self
            .values
            .read()
            .await
            .iter()
            .filter(|(_, value)| value.is_stale(window, now))
            .map(|(key, _)| *key)
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.values.read().await.len())
    }
}
