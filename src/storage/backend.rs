//! Storage backend abstraction for DHT values
//!
//! The DHT core never assumes a particular store. It reads and writes
//! values through this trait, and republishing asks it which keys have gone
//! stale.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

use crate::dht::key::Key;
use anyhow::Result;

/// A stored value together with its last write/refresh time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// The value content
    pub content: String,
    /// When the value was last written or republished
    pub last_published: SystemTime,
}

impl StoredValue {
    /// Create a value stamped with the current time
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            last_published: SystemTime::now(),
        }
    }

    /// Whether the value has not been refreshed within `window`
    pub fn is_stale(&self, window: Duration, now: SystemTime) -> bool {
        now.duration_since(self.last_published)
            .map(|age| age >= window)
            .unwrap_or(false)
    }
}

/// Abstract key-value store backing a DHT node
///
/// Implementations must be safe to share between the receive loops that
/// serve STORE/FIND_VALUE and the application calling `put`/`get`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether a value is stored under `key`
    async fn contains(&self, key: &Key) -> Result<bool>;

    /// The value stored under `key`, if any
    async fn get(&self, key: &Key) -> Result<Option<StoredValue>>;

    /// Write a value, stamping it with the current time
    ///
    /// Writing an existing key replaces its value and refreshes its timestamp.
    async fn put(&self, key: Key, content: String) -> Result<()>;

    /// Keys whose last write is at least `window` old
    async fn keys_stale_since(&self, window: Duration) -> Result<Vec<Key>>;

    /// Number of stored keys
    async fn len(&self) -> Result<usize>;
}
