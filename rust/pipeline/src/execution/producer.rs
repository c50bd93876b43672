use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::FutureExt;
use opentelemetry::metrics::{Counter, Histogram};
use strata_cache::Weighted;
use strata_system::{CleanupGuard, PanicError};
use strata_tracing::{StopWatchUnit, Stopwatch};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::backpressure::{DemandCredit, DemandGate};
use super::memory::{ChunkSizer, MemoryProbe, MemoryVerdict};
use super::tracker::PipelineTracker;
use super::transform::ProducerEvent;
use crate::cache::{Page, QueryCache, QueryFingerprint};
use crate::config::PipelineConfig;
use crate::errors::{PipelineError, SourceError};
use crate::source::{DataSource, Query};
use crate::types::{Chunk, PipelineStatus, Record};

/// Why production stopped early.
enum Stop {
    Cancelled,
    Failed(PipelineError),
}

impl From<PipelineError> for Stop {
    fn from(error: PipelineError) -> Self {
        Stop::Failed(error)
    }
}

struct ProducerMetrics {
    fetch_latency: Histogram<u64>,
    chunks_emitted: Counter<u64>,
    fetch_retries: Counter<u64>,
}

impl ProducerMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("strata_pipeline");
        Self {
            fetch_latency: meter.u64_histogram("source_fetch_latency").build(),
            chunks_emitted: meter.u64_counter("chunks_emitted").build(),
            fetch_retries: meter.u64_counter("source_fetch_retries").build(),
        }
    }
}

/// Everything a producer needs to page through one query.
pub(crate) struct ProducerParts {
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) source: Arc<dyn DataSource>,
    pub(crate) query: Query,
    pub(crate) start_offset: u64,
    pub(crate) cache: QueryCache,
    pub(crate) tracker: Arc<PipelineTracker>,
    pub(crate) gate: DemandGate,
    pub(crate) memory: Arc<dyn MemoryProbe>,
    pub(crate) events: mpsc::Sender<ProducerEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) paused: watch::Receiver<bool>,
}

/// Pulls pages from the source, cache first, and emits them in order to the
/// transform stage. One producer task runs per pipeline.
pub(crate) struct Producer {
    config: Arc<PipelineConfig>,
    source: Arc<dyn DataSource>,
    source_identity: String,
    query: Query,
    cache: QueryCache,
    tracker: Arc<PipelineTracker>,
    gate: DemandGate,
    memory: Arc<dyn MemoryProbe>,
    events: mpsc::Sender<ProducerEvent>,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    offset: u64,
    chunk_index: u64,
    emitted: u64,
    sizer: ChunkSizer,
    metrics: ProducerMetrics,
}

impl Producer {
    pub(crate) fn new(parts: ProducerParts) -> Self {
        let config = parts.config;
        let sizer = ChunkSizer::new(
            config.chunk_size,
            config.min_chunk_size,
            config.degradation_bytes(),
            config.memory_limit_bytes,
        );
        Self {
            source_identity: parts.source.identity(),
            source: parts.source,
            query: parts.query,
            cache: parts.cache,
            tracker: parts.tracker,
            gate: parts.gate,
            memory: parts.memory,
            events: parts.events,
            cancel: parts.cancel,
            paused: parts.paused,
            offset: parts.start_offset,
            chunk_index: 0,
            emitted: 0,
            sizer,
            metrics: ProducerMetrics::new(),
            config,
        }
    }

    /// Produces until the source is exhausted, the pipeline is cancelled or
    /// a fatal error occurs. Always leaves the transform stage a terminal
    /// event unless cancelled.
    pub(crate) async fn run(self) {
        let tracker = self.tracker.clone();
        let events = self.events.clone();

        let error = match AssertUnwindSafe(self.produce()).catch_unwind().await {
            Ok(Ok(total_records)) => {
                tracing::debug!(total_records, "Producer reached the end of the source");
                let _ = events.send(ProducerEvent::Finished { total_records }).await;
                return;
            }
            Ok(Err(Stop::Cancelled)) => {
                tracing::debug!("Producer cancelled");
                return;
            }
            Ok(Err(Stop::Failed(error))) => error,
            Err(panic) => PipelineError::Stage(format!(
                "producer panicked: {}",
                PanicError::new(panic).message()
            )),
        };

        tracing::error!("Producer failed: {error}");
        let reason = error.to_string();
        tracker.finish(PipelineStatus::Failed, Some(reason.clone()));
        let _ = events.send(ProducerEvent::Failed { reason }).await;
    }

    async fn produce(mut self) -> Result<u64, Stop> {
        self.estimate_total().await;
        loop {
            if !self.wait_while_paused().await {
                return Err(Stop::Cancelled);
            }
            let credit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                credit = self.gate.acquire() => credit,
            };
            // A pause may have arrived while waiting for demand.
            if !self.wait_while_paused().await {
                return Err(Stop::Cancelled);
            }

            let limit = self.next_chunk_size()?;
            let key = QueryFingerprint::new(&self.source_identity, &self.query, self.offset, limit);
            let page = match self.cache.get(&key).await {
                Some(page) => {
                    self.tracker.update(|info| info.cache_hits += 1);
                    page
                }
                None => {
                    self.tracker.update(|info| info.cache_misses += 1);
                    let page: Page = Arc::new(self.fetch_with_retry(limit).await?);
                    self.cache.insert(key, page.clone()).await;
                    page
                }
            };

            let fetched = page.len();
            if fetched > 0 {
                self.emit(page, credit).await?;
            }
            if fetched < limit {
                return Ok(self.emitted);
            }
        }
    }

    /// Returns false when the pipeline was cancelled while paused.
    async fn wait_while_paused(&mut self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let paused = *self.paused.borrow_and_update();
            if !paused {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        // The control side is gone while paused; nothing can resume us.
                        return false;
                    }
                }
            }
        }
    }

    async fn estimate_total(&self) {
        let counted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            counted = tokio::time::timeout(self.config.fetch_timeout, self.source.count(&self.query)) => counted,
        };
        match counted {
            Ok(Ok(total)) => self.tracker.update(|info| info.estimated_total = Some(total)),
            Ok(Err(e)) => tracing::debug!("Ignoring failed count: {e}"),
            Err(_) => tracing::debug!("Ignoring count that timed out"),
        }
    }

    fn next_chunk_size(&mut self) -> Result<usize, PipelineError> {
        match self.sizer.observe(self.memory.used_bytes()) {
            MemoryVerdict::Normal => {}
            MemoryVerdict::Degraded { from, to } => {
                tracing::warn!(from, to, "Memory pressure, reducing chunk size");
            }
            MemoryVerdict::Exhausted { used, limit } => {
                return Err(PipelineError::ResourceExhausted { used, limit });
            }
        }
        let size = self.sizer.current();
        let degraded = self.sizer.is_degraded();
        self.tracker.update(|info| {
            info.current_chunk_size = size;
            info.degraded_mode = degraded;
        });
        Ok(size)
    }

    async fn fetch_with_retry(&self, limit: usize) -> Result<Vec<Record>, Stop> {
        let attempts = AtomicUsize::new(0);
        let backoff: ExponentialBuilder = self.config.as_ref().into();
        let (source, query, offset) = (&self.source, &self.query, self.offset);
        let fetch_timeout = self.config.fetch_timeout;
        let fetch_latency = &self.metrics.fetch_latency;
        let attempts_ref = &attempts;

        let fetch = || async move {
            attempts_ref.fetch_add(1, Ordering::SeqCst);
            let _stopwatch = Stopwatch::new(fetch_latency, &[], StopWatchUnit::Millis);
            match tokio::time::timeout(fetch_timeout, source.fetch(query, offset, limit)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(fetch_timeout)),
            }
        };
        let retried = fetch
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(|e: &SourceError| e.is_retryable())
            .notify(|e: &SourceError, delay: Duration| {
                tracing::warn!(offset, "Fetch failed, retrying in {delay:?}: {e}");
                self.metrics.fetch_retries.add(1, &[]);
                self.tracker.record_retry(delay);
            });

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
            result = retried => result,
        };
        result.map_err(|source| {
            Stop::Failed(PipelineError::FetchFailed {
                attempts: attempts.load(Ordering::SeqCst),
                source,
            })
        })
    }

    async fn emit(&mut self, page: Page, credit: Option<DemandCredit>) -> Result<(), Stop> {
        let records = page.len();
        let bytes = page.weight();
        let chunk = Chunk {
            chunk_index: self.chunk_index,
            chunk_size: records,
            offset: self.offset,
            total_processed_so_far: self.emitted + records as u64,
            records: page,
        };

        // The transform stage releases the bytes once it aggregated the chunk.
        self.tracker.add_in_flight(bytes);
        let tracker = self.tracker.clone();
        let in_flight = CleanupGuard::new(move || tracker.sub_in_flight(bytes));
        let event = ProducerEvent::Chunk {
            chunk,
            degraded_mode: self.sizer.is_degraded(),
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
            sent = self.events.send(event) => {
                if sent.is_err() {
                    return Err(Stop::Failed(PipelineError::Stage(
                        "transform stage is gone".to_string(),
                    )));
                }
            }
        }
        in_flight.disarm();
        if let Some(credit) = credit {
            credit.consume();
        }

        self.offset += records as u64;
        self.chunk_index += 1;
        self.emitted += records as u64;
        self.metrics.chunks_emitted.add(1, &[]);
        self.tracker.update(|info| {
            info.records_fetched += records as u64;
            info.chunks_emitted += 1;
        });
        Ok(())
    }
}
