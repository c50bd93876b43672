use std::hash::Hash;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_error::{ErrorCodes, StrataError};
use thiserror::Error;

mod lru;
mod nop;

pub use self::lru::{LruCache, LruCacheConfig};
pub use nop::NopCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid cache config: {0}")]
    InvalidCacheConfig(String),
    #[error("Cache is unavailable: {0}")]
    Unavailable(String),
}

impl StrataError for CacheError {
    fn code(&self) -> ErrorCodes {
        match self {
            CacheError::InvalidCacheConfig(_) => ErrorCodes::InvalidArgument,
            CacheError::Unavailable(_) => ErrorCodes::Unavailable,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CacheConfig {
    Lru(LruCacheConfig),
    Nop,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Lru(LruCacheConfig::default())
    }
}

/// Estimated in-memory size of a cached value, in bytes.
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl<T: Weighted> Weighted for std::sync::Arc<T> {
    fn weight(&self) -> usize {
        self.as_ref().weight()
    }
}

impl<T: Weighted> Weighted for Vec<T> {
    fn weight(&self) -> usize {
        std::mem::size_of::<Self>() + self.iter().map(Weighted::weight).sum::<usize>()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    pub entry_count: usize,
    pub weight: usize,
}

/// A cache offers async access to cached values. Lookups that fail for any
/// reason are safe to treat as misses.
#[async_trait::async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, CacheError>;
    /// Inserts with the cache's default time to live.
    async fn insert(&self, key: K, value: V);
    async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration);
    async fn remove(&self, key: &K);
    async fn clear(&self) -> Result<(), CacheError>;
    fn stats(&self) -> CacheStats;
}

pub fn from_config<K, V>(config: &CacheConfig) -> Result<Box<dyn Cache<K, V>>, Box<dyn StrataError>>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    match config {
        CacheConfig::Lru(lru) => Ok(Box::new(LruCache::new(lru).map_err(|e| e.boxed())?)),
        CacheConfig::Nop => Ok(Box::new(NopCache::default())),
    }
}
