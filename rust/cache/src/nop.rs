use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{CacheError, CacheStats, Weighted};

/// A cache that stores nothing. Used when caching is disabled; every lookup
/// is a miss.
#[derive(Default)]
pub struct NopCache {
    misses: AtomicU64,
}

#[async_trait::async_trait]
impl<K, V> super::Cache<K, V> for NopCache
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    async fn get(&self, _: &K) -> Result<Option<V>, CacheError> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn insert(&self, _: K, _: V) {}

    async fn insert_with_ttl(&self, _: K, _: V, _: Duration) {}

    async fn remove(&self, _: &K) {}

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
