use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use strata_cache::{Cache, CacheConfig, CacheStats};
use strata_config::registry::Injectable;
use strata_error::StrataError;

use crate::source::Query;
use crate::types::Record;

/// A page of records as stored in the query cache and shared with chunks.
pub type Page = Arc<Vec<Record>>;

/// SHA-256 over the source identity, the canonical JSON form of the query,
/// the offset and the limit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryFingerprint([u8; 32]);

impl QueryFingerprint {
    pub fn new(source_identity: &str, query: &Query, offset: u64, limit: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((source_identity.len() as u64).to_le_bytes());
        hasher.update(source_identity.as_bytes());
        if serde_json::to_writer(&mut hasher, query).is_err() {
            hasher.update(format!("{query:?}").as_bytes());
        }
        hasher.update(offset.to_le_bytes());
        hasher.update((limit as u64).to_le_bytes());
        let mut bytes = [0_u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        QueryFingerprint(bytes)
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryFingerprint({self})")
    }
}

/// The query cache as seen by pipelines. Every call is bounded by a timeout,
/// and failures of any kind degrade to a miss.
#[derive(Clone)]
pub struct QueryCache {
    cache: Arc<dyn Cache<QueryFingerprint, Page>>,
    timeout: Duration,
}

impl Injectable for QueryCache {}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("timeout", &self.timeout)
            .field("stats", &self.cache.stats())
            .finish()
    }
}

impl QueryCache {
    pub fn new(cache: Box<dyn Cache<QueryFingerprint, Page>>, timeout: Duration) -> Self {
        Self {
            cache: Arc::from(cache),
            timeout,
        }
    }

    pub fn from_config(
        config: &CacheConfig,
        timeout: Duration,
    ) -> Result<Self, Box<dyn StrataError>> {
        Ok(Self::new(strata_cache::from_config(config)?, timeout))
    }

    pub async fn get(&self, key: &QueryFingerprint) -> Option<Page> {
        match tokio::time::timeout(self.timeout, self.cache.get(key)).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                tracing::warn!(fingerprint = %key, "Cache lookup failed, treating as miss: {e}");
                None
            }
            Err(_) => {
                tracing::warn!(
                    fingerprint = %key,
                    "Cache lookup timed out after {:?}, treating as miss",
                    self.timeout
                );
                None
            }
        }
    }

    pub async fn insert(&self, key: QueryFingerprint, page: Page) {
        if tokio::time::timeout(self.timeout, self.cache.insert(key, page))
            .await
            .is_err()
        {
            tracing::warn!(fingerprint = %key, "Cache insert timed out after {:?}", self.timeout);
        }
    }

    pub async fn invalidate(&self, key: &QueryFingerprint) {
        if tokio::time::timeout(self.timeout, self.cache.remove(key))
            .await
            .is_err()
        {
            tracing::warn!(fingerprint = %key, "Cache remove timed out after {:?}", self.timeout);
        }
    }

    pub async fn clear(&self) {
        match tokio::time::timeout(self.timeout, self.cache.clear()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to clear query cache: {e}"),
            Err(_) => tracing::warn!("Clearing the query cache timed out after {:?}", self.timeout),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
