use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::global;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_config::helpers::{deserialize_duration_from_seconds, serialize_duration_to_seconds};
use strata_tracing::util::{StopWatchUnit, Stopwatch};
use tokio::time::Instant;

use super::{CacheError, CacheStats, Weighted};

const MIB: usize = 1024 * 1024;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LruCacheConfig {
    #[serde(default = "LruCacheConfig::default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "LruCacheConfig::default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    #[serde(
        rename = "ttl_secs",
        default = "LruCacheConfig::default_ttl",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub ttl: Duration,
}

impl LruCacheConfig {
    fn default_max_entries() -> usize {
        1024
    }

    fn default_max_memory_bytes() -> usize {
        64 * MIB
    }

    fn default_ttl() -> Duration {
        Duration::from_secs(300)
    }
}

impl Default for LruCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Self::default_max_entries(),
            max_memory_bytes: Self::default_max_memory_bytes(),
            ttl: Self::default_ttl(),
        }
    }
}

struct Entry<V> {
    value: V,
    weight: usize,
    expires_at: Instant,
}

struct State<K, V> {
    entries: ::lru::LruCache<K, Entry<V>>,
    // Sum of the weights of `entries`.
    weight: usize,
}

impl<K, V> State<K, V>
where
    K: Eq + Hash,
{
    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.pop(key)?;
        self.weight -= entry.weight;
        Some(entry)
    }

    fn pop_least_recent(&mut self) -> Option<K> {
        let (key, entry) = self.entries.pop_lru()?;
        self.weight -= entry.weight;
        Some(key)
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct Metrics {
    cache_hit: Counter<u64>,
    cache_miss: Counter<u64>,
    cache_eviction: Counter<u64>,
    get_latency: Histogram<u64>,
    insert_latency: Histogram<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("strata_cache");
        Self {
            cache_hit: meter.u64_counter("cache_hit").build(),
            cache_miss: meter.u64_counter("cache_miss").build(),
            cache_eviction: meter.u64_counter("cache_eviction").build(),
            get_latency: meter.u64_histogram("cache_get_latency").build(),
            insert_latency: meter.u64_histogram("cache_insert_latency").build(),
        }
    }
}

struct Inner<K, V> {
    config: LruCacheConfig,
    state: Mutex<State<K, V>>,
    counters: Counters,
    metrics: Metrics,
}

/// In-memory cache with per-entry time to live and least-recently-used
/// eviction, bounded both by entry count and by total weight.
///
/// Expired entries are only noticed on access; they count as a miss and are
/// dropped at that point. Cloning the cache yields a handle to the same store.
pub struct LruCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for LruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> LruCache<K, V>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    pub fn new(config: &LruCacheConfig) -> Result<Self, CacheError> {
        let Some(capacity) = NonZeroUsize::new(config.max_entries) else {
            return Err(CacheError::InvalidCacheConfig(
                "max_entries must be greater than zero".to_string(),
            ));
        };
        if config.max_memory_bytes == 0 {
            return Err(CacheError::InvalidCacheConfig(
                "max_memory_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                state: Mutex::new(State {
                    entries: ::lru::LruCache::new(capacity),
                    weight: 0,
                }),
                counters: Counters::default(),
                metrics: Metrics::new(),
            }),
        })
    }

    fn record_miss(&self) {
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.cache_miss.add(1, &[]);
    }

    fn record_hit(&self) {
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.cache_hit.add(1, &[]);
    }
}

#[async_trait::async_trait]
impl<K, V> super::Cache<K, V> for LruCache<K, V>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        let _stopwatch = Stopwatch::new(
            &self.inner.metrics.get_latency,
            &[],
            StopWatchUnit::Micros,
        );
        let now = Instant::now();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let expired = match state.entries.peek(key) {
            None => {
                drop(guard);
                self.record_miss();
                return Ok(None);
            }
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            state.remove(key);
            drop(guard);
            self.inner.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.record_miss();
            return Ok(None);
        }
        // `get` promotes the entry to most recently used.
        let value = state.entries.get(key).map(|entry| entry.value.clone());
        drop(guard);
        if value.is_some() {
            self.record_hit();
        } else {
            self.record_miss();
        }
        Ok(value)
    }

    async fn insert(&self, key: K, value: V) {
        let ttl = self.inner.config.ttl;
        self.insert_with_ttl(key, value, ttl).await;
    }

    async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let _stopwatch = Stopwatch::new(
            &self.inner.metrics.insert_latency,
            &[],
            StopWatchUnit::Micros,
        );
        let weight = value.weight();
        let max_entries = self.inner.config.max_entries;
        let max_weight = self.inner.config.max_memory_bytes;

        let mut state = self.inner.state.lock();
        state.remove(&key);
        if weight > max_weight {
            tracing::debug!(
                weight,
                max_weight,
                "Value is larger than the cache memory limit, not caching"
            );
            return;
        }

        let mut evicted = 0u64;
        while state.entries.len() >= max_entries || state.weight + weight > max_weight {
            if state.pop_least_recent().is_none() {
                break;
            }
            evicted += 1;
        }

        // The loop above leaves room, so `put` never evicts on its own.
        state.weight += weight;
        state.entries.put(
            key,
            Entry {
                value,
                weight,
                expires_at: Instant::now() + ttl,
            },
        );
        drop(state);

        if evicted > 0 {
            self.inner
                .counters
                .evictions
                .fetch_add(evicted, Ordering::Relaxed);
            self.inner.metrics.cache_eviction.add(evicted, &[]);
        }
    }

    async fn remove(&self, key: &K) {
        self.inner.state.lock().remove(key);
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.weight = 0;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let (entry_count, weight) = {
            let state = self.inner.state.lock();
            (state.entries.len(), state.weight)
        };
        let hits = self.inner.counters.hits.load(Ordering::Relaxed);
        let misses = self.inner.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.inner.counters.evictions.load(Ordering::Relaxed),
            expirations: self.inner.counters.expirations.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            entry_count,
            weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cache;

    #[derive(Clone, Debug, PartialEq)]
    struct Blob(usize);

    impl Weighted for Blob {
        fn weight(&self) -> usize {
            self.0
        }
    }

    fn cache(max_entries: usize, max_memory_bytes: usize) -> LruCache<u32, Blob> {
        LruCache::new(&LruCacheConfig {
            max_entries,
            max_memory_bytes,
            ttl: Duration::from_secs(60),
        })
        .expect("valid config")
    }

    #[tokio::test]
    async fn evicts_least_recently_accessed_entry_at_entry_cap() {
        let cache = cache(2, 1_000);
        cache.insert(1, Blob(1)).await;
        cache.insert(2, Blob(1)).await;
        // Touch 1 so that 2 becomes the eviction candidate.
        assert!(cache.get(&1).await.expect("get").is_some());
        cache.insert(3, Blob(1)).await;

        assert!(cache.get(&2).await.expect("get").is_none());
        assert!(cache.get(&1).await.expect("get").is_some());
        assert!(cache.get(&3).await.expect("get").is_some());
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entry_count, 2);
    }

    #[tokio::test]
    async fn evicts_until_the_new_entry_fits_in_memory() {
        let cache = cache(100, 10);
        cache.insert(1, Blob(4)).await;
        cache.insert(2, Blob(4)).await;
        cache.insert(3, Blob(6)).await;

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.weight, 10);
        assert!(cache.get(&1).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn memory_pressure_evicts_in_access_order() {
        let cache = cache(100, 10);
        cache.insert(1, Blob(3)).await;
        cache.insert(2, Blob(3)).await;
        cache.insert(3, Blob(3)).await;
        assert!(cache.get(&1).await.expect("get").is_some());
        cache.insert(4, Blob(4)).await;

        assert!(cache.get(&2).await.expect("get").is_none());
        assert!(cache.get(&3).await.expect("get").is_some());
        assert!(cache.get(&1).await.expect("get").is_some());
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.weight, 10);
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let result = LruCache::<u32, Blob>::new(&LruCacheConfig {
            max_entries: 0,
            ..LruCacheConfig::default()
        });
        assert!(matches!(result, Err(CacheError::InvalidCacheConfig(_))));
    }

    #[tokio::test]
    async fn oversized_values_are_not_cached() {
        let cache = cache(100, 10);
        cache.insert(1, Blob(3)).await;
        cache.insert(2, Blob(11)).await;
        assert!(cache.get(&2).await.expect("get").is_none());
        assert!(cache.get(&1).await.expect("get").is_some());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_misses() {
        let cache = cache(10, 100);
        cache
            .insert_with_ttl(1, Blob(1), Duration::from_secs(5))
            .await;
        assert!(cache.get(&1).await.expect("get").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&1).await.expect("get").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entry_count, 0);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reinserting_a_key_replaces_its_weight() {
        let cache = cache(10, 100);
        cache.insert(1, Blob(40)).await;
        cache.insert(1, Blob(10)).await;
        assert_eq!(cache.stats().weight, 10);
        assert_eq!(cache.get(&1).await.expect("get"), Some(Blob(10)));
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let cache = cache(10, 100);
        cache.insert(1, Blob(1)).await;
        cache.insert(2, Blob(1)).await;
        cache.remove(&1).await;
        assert!(cache.get(&1).await.expect("get").is_none());
        cache.clear().await.expect("clear");
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.weight, 0);
    }

    #[tokio::test]
    async fn clones_share_the_same_store() {
        let cache = cache(10, 100);
        let other = cache.clone();
        cache.insert(7, Blob(1)).await;
        assert_eq!(other.get(&7).await.expect("get"), Some(Blob(1)));
    }
}
