use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use strata_cache::CacheStats;
use strata_config::registry::Registry;
use strata_config::Configurable;
use strata_error::StrataError;
use strata_system::{ComponentHandle, ComponentState, PanicError, System};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::cache::QueryCache;
use crate::config::{PipelineConfig, PipelineServiceConfig};
use crate::consumer::{drive_consumer, ChunkConsumer};
use crate::errors::{ConsumerError, PipelineError};
use crate::execution::aggregator::Aggregator;
use crate::execution::backpressure::DemandGate;
use crate::execution::memory::AccountingMemoryProbe;
use crate::execution::producer::{Producer, ProducerParts};
use crate::execution::tracker::PipelineTracker;
use crate::execution::transform::{SnapshotRequest, TransformStage};
use crate::execution::{ChunkStream, MemoryProbe};
use crate::loader::{apply_load_strategy, RelationshipLoadingConfig};
use crate::resolve::{resolve_cumulative, DeclaredFieldResolver, FieldResolver};
use crate::source::{DataSource, Query};
use crate::types::{
    AggregationSnapshot, AggregationSpec, PipelineCounts, PipelineFilter, PipelineInfo,
    PipelineStatus, StreamId,
};

/// What to run: a query against a source, and how to group its records.
#[derive(Debug)]
pub struct PipelineOptions {
    source: Arc<dyn DataSource>,
    query: Query,
    aggregations: Vec<AggregationSpec>,
    resolver: Arc<dyn FieldResolver>,
    relationship_loading: Option<RelationshipLoadingConfig>,
    start_offset: u64,
    config: Option<PipelineConfig>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
}

impl PipelineOptions {
    pub fn new(source: Arc<dyn DataSource>, query: Query) -> Self {
        Self {
            source,
            query,
            aggregations: Vec::new(),
            resolver: Arc::new(DeclaredFieldResolver::new()),
            relationship_loading: None,
            start_offset: 0,
            config: None,
            memory_probe: None,
        }
    }

    pub fn with_aggregations(mut self, aggregations: Vec<AggregationSpec>) -> Self {
        self.aggregations = aggregations;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn FieldResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Overrides the orchestrator's relationship loading for this pipeline.
    pub fn with_relationship_loading(mut self, loading: RelationshipLoadingConfig) -> Self {
        self.relationship_loading = Some(loading);
        self
    }

    pub fn starting_at(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    /// Overrides the orchestrator's pipeline config for this pipeline.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the default probe, which counts the bytes the pipeline holds.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }
}

/// Everything the orchestrator needs to control one running pipeline.
#[derive(Clone, Debug)]
struct PipelineHandle {
    config: Arc<PipelineConfig>,
    tracker: Arc<PipelineTracker>,
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    transform: ComponentHandle<TransformStage>,
}

impl PipelineHandle {
    /// Cancels the producer and stops the transform stage. Idempotent.
    fn halt(&self) {
        self.cancel.cancel();
        self.transform.stop();
    }

    async fn live_snapshot(&self) -> Result<Option<AggregationSnapshot>, PipelineError> {
        if self.transform.state() == ComponentState::Stopped {
            return Ok(None);
        }
        let timeout = self.config.snapshot_timeout;
        match tokio::time::timeout(timeout, self.transform.request(SnapshotRequest, None)).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            // The stage exited between the status check and the request.
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(PipelineError::Timeout("Aggregation snapshot", timeout)),
        }
    }

    /// Records a consumer-side failure on the pipeline, keeping the partial
    /// aggregation state for diagnostics.
    async fn fail_from_consumer(&self, error: &ConsumerError) {
        if matches!(
            error,
            ConsumerError::PipelineFailed(_) | ConsumerError::PipelineStopped
        ) {
            return;
        }
        let stream_id = self.tracker.stream_id();
        tracing::error!(%stream_id, "Consumer failed: {error}");
        if self.tracker.frozen_snapshot().is_none() {
            match self.live_snapshot().await {
                Ok(Some(snapshot)) => self.tracker.publish_snapshot(snapshot),
                Ok(None) => {}
                Err(e) => tracing::warn!(%stream_id, "Could not keep the partial snapshot: {e}"),
            }
        }
        self.tracker
            .finish(PipelineStatus::Failed, Some(format!("consumer failed: {error}")));
        self.halt();
    }
}

/// Starts pipelines and is the single entry point for controlling and
/// monitoring them. Pipelines are independent; the query cache is shared.
#[derive(Debug)]
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    system: System,
    cache: QueryCache,
    pipelines: Arc<DashMap<StreamId, PipelineHandle>>,
    tasks: TaskTracker,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let cache = QueryCache::from_config(&config.cache, config.cache_timeout)
            .map_err(|e| PipelineError::InvalidConfig(format!("query cache: {e}")))?;
        Self::with_cache(config, cache)
    }

    /// Builds an orchestrator around an existing, possibly shared, cache.
    pub fn with_cache(config: PipelineConfig, cache: QueryCache) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            system: System::new(),
            cache,
            pipelines: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Starts a pipeline and returns the stream of its transformed chunks.
    /// Dropping the stream leaves the pipeline aggregating without delivery.
    pub fn start_pipeline(
        &self,
        options: PipelineOptions,
    ) -> Result<(StreamId, ChunkStream), PipelineError> {
        if self.tasks.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        self.prune_terminal();
        let config = match options.config {
            Some(config) => {
                config.validate()?;
                Arc::new(config)
            }
            None => self.config.clone(),
        };
        let loading = options
            .relationship_loading
            .as_ref()
            .unwrap_or(&config.relationship_loading);
        let query = apply_load_strategy(&options.query, loading)?;
        let specs = resolve_cumulative(&options.aggregations, options.resolver.as_ref());

        let stream_id = StreamId::new();
        let tracker = Arc::new(PipelineTracker::new(stream_id, config.chunk_size));
        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let gate = DemandGate::new(config.max_demand);
        let (events_tx, events_rx) = mpsc::channel(config.component_queue_size);
        // Demand never exceeds `max_demand` chunks, so the stage never blocks
        // on a slow consumer.
        let (chunks_tx, chunks_rx) = mpsc::channel(config.max_demand.max(1));
        let memory: Arc<dyn MemoryProbe> = match options.memory_probe {
            Some(probe) => probe,
            None => Arc::new(AccountingMemoryProbe::new(tracker.clone())),
        };

        let levels = specs.len();
        let stage = TransformStage::new(
            Aggregator::new(specs, config.max_groups_per_spec),
            tracker.clone(),
            events_rx,
            chunks_tx,
            cancel.clone(),
            config.component_queue_size,
        );
        let transform = self.system.start_component(stage);

        let producer = Producer::new(ProducerParts {
            config: config.clone(),
            source: options.source,
            query,
            start_offset: options.start_offset,
            cache: self.cache.clone(),
            tracker: tracker.clone(),
            gate: gate.clone(),
            memory,
            events: events_tx,
            cancel: cancel.clone(),
            paused: paused_rx,
        });
        self.tasks.spawn(
            producer
                .run()
                .instrument(tracing::info_span!("producer", stream_id = %stream_id)),
        );

        self.pipelines.insert(
            stream_id,
            PipelineHandle {
                config: config.clone(),
                tracker: tracker.clone(),
                cancel,
                paused: Arc::new(paused_tx),
                transform,
            },
        );
        tracing::info!(
            %stream_id,
            chunk_size = config.chunk_size,
            levels,
            start_offset = options.start_offset,
            "Started pipeline"
        );
        Ok((stream_id, ChunkStream::new(chunks_rx, gate, tracker)))
    }

    /// Starts a pipeline and drives `consumer` over it. Consumer failures,
    /// timeouts and panics fail the pipeline; the task resolves to the
    /// consumer's output only when the pipeline completed.
    pub fn start_pipeline_with_consumer<C>(
        &self,
        options: PipelineOptions,
        consumer: C,
    ) -> Result<(StreamId, JoinHandle<Result<C::Output, PipelineError>>), PipelineError>
    where
        C: ChunkConsumer + 'static,
        C::State: 'static,
        C::Output: 'static,
    {
        let (stream_id, stream) = self.start_pipeline(options)?;
        let handle = self.handle(stream_id)?;
        let timeout = handle.config.consumer_timeout;

        let task = async move {
            let error = match AssertUnwindSafe(drive_consumer(stream, consumer, timeout))
                .catch_unwind()
                .await
            {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(error)) => error,
                Err(panic) => ConsumerError::from(PanicError::new(panic)),
            };
            handle.fail_from_consumer(&error).await;
            Err(PipelineError::Consumer(error))
        };
        let join = self
            .tasks
            .spawn(task.instrument(tracing::info_span!("consumer", stream_id = %stream_id)));
        Ok((stream_id, join))
    }

    /// Forgets the longest-ended pipelines beyond `max_retained_terminal`.
    fn prune_terminal(&self) {
        let mut terminal: Vec<_> = self
            .pipelines
            .iter()
            .filter_map(|entry| {
                let info = entry.tracker.info();
                info.status
                    .is_terminal()
                    .then(|| (info.finished_at.unwrap_or(info.started_at), info.stream_id))
            })
            .collect();
        let excess = terminal
            .len()
            .saturating_sub(self.config.max_retained_terminal);
        if excess == 0 {
            return;
        }
        terminal.sort();
        for (_, stream_id) in terminal.into_iter().take(excess) {
            if let Some((_, handle)) = self.pipelines.remove(&stream_id) {
                handle.halt();
                handle.tracker.release();
                tracing::debug!(%stream_id, "Pruned ended pipeline");
            }
        }
    }

    fn handle(&self, stream_id: StreamId) -> Result<PipelineHandle, PipelineError> {
        self.pipelines
            .get(&stream_id)
            .map(|handle| handle.clone())
            .ok_or(PipelineError::NotFound(stream_id))
    }

    pub fn get_pipeline_info(&self, stream_id: StreamId) -> Result<PipelineInfo, PipelineError> {
        Ok(self.handle(stream_id)?.tracker.info())
    }

    /// Pipelines matching `filter`, oldest first.
    pub fn list_pipelines(&self, filter: &PipelineFilter) -> Vec<PipelineInfo> {
        let mut infos: Vec<PipelineInfo> = self
            .pipelines
            .iter()
            .map(|entry| entry.tracker.info())
            .filter(|info| filter.matches(info))
            .collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    pub fn pipeline_counts(&self) -> PipelineCounts {
        let mut counts = PipelineCounts::default();
        for entry in self.pipelines.iter() {
            counts.add(entry.tracker.status());
        }
        counts
    }

    /// Takes effect at the next chunk boundary. Pausing a paused pipeline is
    /// a no-op.
    pub fn pause_pipeline(&self, stream_id: StreamId) -> Result<(), PipelineError> {
        let handle = self.handle(stream_id)?;
        handle
            .tracker
            .transition(&[PipelineStatus::Running], PipelineStatus::Paused)
            .map_err(|status| PipelineError::InvalidTransition {
                stream_id,
                status,
                action: "pause",
            })?;
        handle.paused.send_replace(true);
        tracing::info!(%stream_id, "Paused pipeline");
        Ok(())
    }

    pub fn resume_pipeline(&self, stream_id: StreamId) -> Result<(), PipelineError> {
        let handle = self.handle(stream_id)?;
        handle
            .tracker
            .transition(&[PipelineStatus::Paused], PipelineStatus::Running)
            .map_err(|status| PipelineError::InvalidTransition {
                stream_id,
                status,
                action: "resume",
            })?;
        handle.paused.send_replace(false);
        tracing::info!(%stream_id, "Resumed pipeline");
        Ok(())
    }

    /// Cancels both stages and releases the aggregation state. The pipeline
    /// record stays, as `stopped`, until removed.
    pub fn stop_pipeline(&self, stream_id: StreamId) -> Result<(), PipelineError> {
        let handle = self.handle(stream_id)?;
        handle
            .tracker
            .transition(
                &[PipelineStatus::Running, PipelineStatus::Paused],
                PipelineStatus::Stopped,
            )
            .map_err(|status| PipelineError::InvalidTransition {
                stream_id,
                status,
                action: "stop",
            })?;
        handle.halt();
        handle.tracker.release();
        tracing::info!(%stream_id, "Stopped pipeline");
        Ok(())
    }

    /// The current aggregation state. Live while the pipeline runs; the
    /// frozen final or partial snapshot once it ended.
    pub async fn get_aggregation_snapshot(
        &self,
        stream_id: StreamId,
    ) -> Result<AggregationSnapshot, PipelineError> {
        let handle = self.handle(stream_id)?;
        if handle.tracker.is_released() {
            return Err(PipelineError::StateReleased(stream_id));
        }
        if let Some(frozen) = handle.tracker.frozen_snapshot() {
            return Ok(frozen.as_ref().clone());
        }
        if let Some(live) = handle.live_snapshot().await? {
            return Ok(live);
        }
        // The stage finished while we asked.
        handle
            .tracker
            .frozen_snapshot()
            .map(|frozen| frozen.as_ref().clone())
            .ok_or(PipelineError::StateReleased(stream_id))
    }

    /// The final aggregation state of a completed pipeline.
    pub fn get_aggregation_state(
        &self,
        stream_id: StreamId,
    ) -> Result<AggregationSnapshot, PipelineError> {
        let handle = self.handle(stream_id)?;
        let status = handle.tracker.status();
        if status != PipelineStatus::Completed {
            return Err(PipelineError::NotCompleted { stream_id, status });
        }
        handle
            .tracker
            .frozen_snapshot()
            .map(|frozen| frozen.as_ref().clone())
            .ok_or(PipelineError::StateReleased(stream_id))
    }

    /// Waits until the pipeline reaches a terminal status.
    pub async fn await_terminal(
        &self,
        stream_id: StreamId,
    ) -> Result<PipelineStatus, PipelineError> {
        let mut status = self.handle(stream_id)?.tracker.subscribe();
        let terminal = status
            .wait_for(PipelineStatus::is_terminal)
            .await
            .map_err(|_| PipelineError::NotFound(stream_id))?;
        Ok(*terminal)
    }

    /// Drops the record of a pipeline that already ended. Records beyond
    /// `max_retained_terminal` are also pruned, oldest first, whenever a new
    /// pipeline starts.
    pub fn remove_pipeline(&self, stream_id: StreamId) -> Result<PipelineInfo, PipelineError> {
        let handle = self.handle(stream_id)?;
        let status = handle.tracker.status();
        if !status.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                stream_id,
                status,
                action: "remove",
            });
        }
        handle.halt();
        handle.tracker.release();
        self.pipelines.remove(&stream_id);
        tracing::debug!(%stream_id, "Removed pipeline");
        Ok(handle.tracker.info())
    }

    /// Stops every active pipeline and waits for all stages to exit. No new
    /// pipelines start afterwards.
    pub async fn shutdown(&self) {
        self.tasks.close();
        let active: Vec<StreamId> = self
            .pipelines
            .iter()
            .filter(|entry| !entry.tracker.status().is_terminal())
            .map(|entry| *entry.key())
            .collect();
        for stream_id in active {
            if let Err(e) = self.stop_pipeline(stream_id) {
                tracing::debug!(%stream_id, "Pipeline ended during shutdown: {e}");
            }
        }
        self.system.stop();
        self.system.join().await;
        self.tasks.wait().await;
        tracing::info!("Pipeline orchestrator shut down");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.cache
    }
}

#[async_trait]
impl Configurable<PipelineServiceConfig> for PipelineOrchestrator {
    async fn try_from_config(
        config: &PipelineServiceConfig,
        registry: &Registry,
    ) -> Result<Self, Box<dyn StrataError>> {
        let pipeline = &config.pipeline;
        // Reuse the query cache another service already registered.
        let cache = registry.get_or_try_register_with(|| {
            QueryCache::from_config(&pipeline.cache, pipeline.cache_timeout)
        })?;
        Self::with_cache(pipeline.clone(), cache).map_err(|e| e.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryDataSource;
    use crate::types::Record;
    use std::time::Duration;

    fn source(records: i64) -> Arc<InMemoryDataSource> {
        Arc::new(InMemoryDataSource::new(
            "orders",
            (0..records)
                .map(|id| Record::new().with("id", id).with("region", "West"))
                .collect(),
        ))
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            chunk_size: 10,
            min_chunk_size: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_pipelines_are_not_found() {
        let orchestrator = PipelineOrchestrator::new(config()).expect("valid config");
        let stream_id = StreamId::new();
        assert!(matches!(
            orchestrator.get_pipeline_info(stream_id),
            Err(PipelineError::NotFound(id)) if id == stream_id
        ));
        assert!(matches!(
            orchestrator.pause_pipeline(stream_id),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_overrides_are_rejected_before_starting() {
        let orchestrator = PipelineOrchestrator::new(config()).expect("valid config");
        let options = PipelineOptions::new(source(5), Query::new("orders")).with_config(
            PipelineConfig {
                chunk_size: 0,
                ..config()
            },
        );
        assert!(matches!(
            orchestrator.start_pipeline(options),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert_eq!(orchestrator.pipeline_counts().total(), 0);
    }

    #[tokio::test]
    async fn removing_requires_a_terminal_pipeline() {
        let orchestrator = PipelineOrchestrator::new(config()).expect("valid config");
        let data = source(25);
        data.set_latency(Some(Duration::from_millis(20)));
        let (stream_id, _stream) = orchestrator
            .start_pipeline(PipelineOptions::new(data, Query::new("orders")))
            .expect("pipeline starts");

        assert!(matches!(
            orchestrator.remove_pipeline(stream_id),
            Err(PipelineError::InvalidTransition { action: "remove", .. })
        ));
        orchestrator.stop_pipeline(stream_id).expect("stops");
        let removed = orchestrator.remove_pipeline(stream_id).expect("removed");
        assert_eq!(removed.status, PipelineStatus::Stopped);
        assert!(orchestrator.list_pipelines(&PipelineFilter::all()).is_empty());
    }

    #[tokio::test]
    async fn only_the_most_recently_ended_pipelines_are_retained() {
        let orchestrator = PipelineOrchestrator::new(PipelineConfig {
            max_retained_terminal: 1,
            ..config()
        })
        .expect("valid config");

        let mut ended = Vec::new();
        for _ in 0..2 {
            let (stream_id, stream) = orchestrator
                .start_pipeline(PipelineOptions::new(source(3), Query::new("orders")))
                .expect("pipeline starts");
            drop(stream);
            orchestrator.await_terminal(stream_id).await.expect("known");
            ended.push(stream_id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(orchestrator.pipeline_counts().completed, 2);

        let data = source(25);
        data.set_latency(Some(Duration::from_millis(20)));
        let (running, _stream) = orchestrator
            .start_pipeline(PipelineOptions::new(data, Query::new("orders")))
            .expect("pipeline starts");
        assert!(matches!(
            orchestrator.get_pipeline_info(ended[0]),
            Err(PipelineError::NotFound(_))
        ));
        assert_eq!(
            orchestrator.get_pipeline_info(ended[1]).expect("retained").status,
            PipelineStatus::Completed
        );
        assert!(orchestrator.get_pipeline_info(running).is_ok());
        orchestrator.stop_pipeline(running).expect("stops");
    }

    #[tokio::test]
    async fn shutdown_stops_active_pipelines_and_refuses_new_ones() {
        let orchestrator = PipelineOrchestrator::new(config()).expect("valid config");
        let data = source(100);
        data.set_latency(Some(Duration::from_millis(20)));
        let (stream_id, _stream) = orchestrator
            .start_pipeline(PipelineOptions::new(data.clone(), Query::new("orders")))
            .expect("pipeline starts");

        orchestrator.shutdown().await;
        assert_eq!(
            orchestrator.get_pipeline_info(stream_id).expect("kept").status,
            PipelineStatus::Stopped
        );
        assert!(matches!(
            orchestrator.start_pipeline(PipelineOptions::new(data, Query::new("orders"))),
            Err(PipelineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn configurable_shares_the_registered_cache() {
        let registry = Registry::new();
        let service_config = PipelineServiceConfig {
            pipeline: config(),
            ..Default::default()
        };
        let first = PipelineOrchestrator::try_from_config(&service_config, &registry)
            .await
            .expect("builds");
        let shared = registry.get::<QueryCache>().expect("cache registered");

        let (stream_id, stream) = first
            .start_pipeline(PipelineOptions::new(source(3), Query::new("orders")))
            .expect("pipeline starts");
        drop(stream);
        assert_eq!(
            first.await_terminal(stream_id).await.expect("known"),
            PipelineStatus::Completed
        );
        assert_eq!(shared.stats().misses, first.cache_stats().misses);
        assert!(shared.stats().misses > 0);

        let second = PipelineOrchestrator::try_from_config(&service_config, &registry)
            .await
            .expect("builds");
        assert_eq!(second.cache_stats().misses, shared.stats().misses);
    }
}
