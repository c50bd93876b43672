use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{DataSource, Query};
use crate::errors::SourceError;
use crate::loader::LoadMode;
use crate::types::{Record, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct FetchLogEntry {
    pub offset: u64,
    pub limit: usize,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Failures {
    next: VecDeque<SourceError>,
    always: Option<SourceError>,
    at_offset: HashMap<u64, SourceError>,
    count: Option<SourceError>,
}

#[derive(Debug)]
struct Inner {
    identity: String,
    records: Vec<Record>,
    // Relationship paths the records may carry as nested records.
    relationships: Mutex<Vec<String>>,
    // Optional relationships the source attaches when asked `IfAvailable`.
    available: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    failures: Mutex<Failures>,
    fetch_log: Mutex<Vec<FetchLogEntry>>,
    fetch_calls: AtomicUsize,
    count_calls: AtomicUsize,
}

/// A `DataSource` over a vector of records, for tests and embedding.
///
/// Clones share the same records, counters and injected failures, so a test
/// can keep one clone to steer the copy handed to a pipeline.
#[derive(Clone, Debug)]
pub struct InMemoryDataSource {
    inner: Arc<Inner>,
}

impl InMemoryDataSource {
    pub fn new(identity: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity: identity.into(),
                records,
                relationships: Mutex::new(Vec::new()),
                available: Mutex::new(HashSet::new()),
                latency: Mutex::new(None),
                failures: Mutex::new(Failures::default()),
                fetch_log: Mutex::new(Vec::new()),
                fetch_calls: AtomicUsize::new(0),
                count_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Declares the relationship paths present in the records. Declared
    /// relationships that a query does not preload are stripped from results.
    pub fn with_relationships<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        // Deepest first, so children go before the parents holding them.
        paths.sort_by_key(|path| std::cmp::Reverse(path.split('.').count()));
        *self.inner.relationships.lock() = paths;
        self
    }

    /// Relationships attached when a query asks for them `IfAvailable`.
    pub fn with_available<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.inner.available.lock() = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// The next `times` fetches fail with `error`.
    pub fn fail_next(&self, times: usize, error: SourceError) {
        let mut failures = self.inner.failures.lock();
        failures.next.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_always(&self, error: SourceError) {
        self.inner.failures.lock().always = Some(error);
    }

    /// Every fetch starting at `offset` fails with `error`.
    pub fn fail_at_offset(&self, offset: u64, error: SourceError) {
        self.inner.failures.lock().at_offset.insert(offset, error);
    }

    pub fn fail_count(&self, error: SourceError) {
        self.inner.failures.lock().count = Some(error);
    }

    pub fn clear_failures(&self) {
        *self.inner.failures.lock() = Failures::default();
    }

    pub fn fetch_calls(&self) -> usize {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> usize {
        self.inner.count_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_log(&self) -> Vec<FetchLogEntry> {
        self.inner.fetch_log.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    fn injected_failure(&self, offset: u64) -> Option<SourceError> {
        let mut failures = self.inner.failures.lock();
        if let Some(error) = &failures.always {
            return Some(error.clone());
        }
        if let Some(error) = failures.at_offset.get(&offset) {
            return Some(error.clone());
        }
        failures.next.pop_front()
    }

    async fn simulate_latency(&self) {
        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn matches(query: &Query, record: &Record) -> bool {
        query.filters.iter().all(|(path, expected)| {
            record.get_path(path).cloned().unwrap_or(Value::Null) == Value::from(expected.clone())
        })
    }

    fn attach_relationships(&self, query: &Query, mut record: Record) -> Record {
        let relationships = self.inner.relationships.lock();
        let available = self.inner.available.lock();
        for path in relationships.iter() {
            let keep = match query.preload.mode_of(path) {
                Some(LoadMode::Preload) => true,
                Some(LoadMode::IfAvailable) => available.contains(path),
                None => false,
            };
            if !keep {
                let segments: Vec<&str> = path.split('.').collect();
                remove_path(&mut record, &segments);
            }
        }
        record
    }
}

fn remove_path(record: &mut Record, segments: &[&str]) {
    match segments {
        [] => {}
        [last] => {
            record.remove(last);
        }
        [first, rest @ ..] => {
            if let Some(Value::Record(nested)) = record.get_mut(first) {
                remove_path(nested, rest);
            }
        }
    }
}

#[async_trait]
impl DataSource for InMemoryDataSource {
    fn identity(&self) -> String {
        self.inner.identity.clone()
    }

    async fn fetch(
        &self,
        query: &Query,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Record>, SourceError> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_log.lock().push(FetchLogEntry {
            offset,
            limit,
            at: Instant::now(),
        });
        self.simulate_latency().await;
        if let Some(error) = self.injected_failure(offset) {
            return Err(error);
        }

        Ok(self
            .inner
            .records
            .iter()
            .filter(|record| Self::matches(query, record))
            .skip(offset as usize)
            .take(limit)
            .map(|record| self.attach_relationships(query, record.clone()))
            .collect())
    }

    async fn count(&self, query: &Query) -> Result<u64, SourceError> {
        self.inner.count_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(error) = self.inner.failures.lock().count.clone() {
            return Err(error);
        }
        Ok(self
            .inner
            .records
            .iter()
            .filter(|record| Self::matches(query, record))
            .count() as u64)
    }
}
