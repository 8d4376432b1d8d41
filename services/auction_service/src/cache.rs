//! Small read-through TTL cache.
//!
//! Serves the hot read paths (current auction, current round, leaderboard)
//! where a few seconds of staleness is acceptable. Write paths never
//! consult it for correctness decisions; they only invalidate entries
//! they made stale.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use carousel_common::Result;

/// Keyed cache where every entry expires `ttl` after it was loaded.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh value for `key`, if present and not expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(loaded, _)| loaded.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    pub async fn put(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.insert(key, (Instant::now(), value));
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Read-through: returns the cached value or runs `loader` and caches
    /// its result. A loader error is propagated and nothing is cached.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }
        let value = loader().await?;
        self.put(key, value.clone()).await;
        Ok(value)
    }
}
