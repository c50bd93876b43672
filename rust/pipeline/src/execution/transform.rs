use std::sync::Arc;

use async_trait::async_trait;
use strata_cache::Weighted;
use strata_error::StrataError;
use strata_system::{get_panic_message, Component, ComponentContext, Handler, StreamHandler};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::aggregator::Aggregator;
use super::tracker::PipelineTracker;
use crate::types::{
    AggregationSnapshot, Chunk, ChunkMetadata, PipelineStatus, StreamId, TransformedChunk,
};

/// What the producer tells the transform stage.
#[derive(Debug)]
pub(crate) enum ProducerEvent {
    Chunk { chunk: Chunk, degraded_mode: bool },
    Finished { total_records: u64 },
    Failed { reason: String },
}

/// Asks for a copy of the live aggregation state. Replies `None` once the
/// state was dropped.
#[derive(Debug)]
pub(crate) struct SnapshotRequest;

/// Single owner of a pipeline's aggregation state. Consumes the producer's
/// events in order, forwards every chunk downstream with its metadata and
/// publishes the frozen snapshot when the producer ends.
#[derive(Debug)]
pub(crate) struct TransformStage {
    stream_id: StreamId,
    queue_size: usize,
    aggregator: Option<Aggregator>,
    tracker: Arc<PipelineTracker>,
    events: Option<mpsc::Receiver<ProducerEvent>>,
    downstream: Option<mpsc::Sender<TransformedChunk>>,
    pipeline_token: CancellationToken,
    own_token: Option<CancellationToken>,
}

impl TransformStage {
    pub(crate) fn new(
        aggregator: Aggregator,
        tracker: Arc<PipelineTracker>,
        events: mpsc::Receiver<ProducerEvent>,
        downstream: mpsc::Sender<TransformedChunk>,
        pipeline_token: CancellationToken,
        queue_size: usize,
    ) -> Self {
        Self {
            stream_id: tracker.stream_id(),
            queue_size,
            aggregator: Some(aggregator),
            tracker,
            events: Some(events),
            downstream: Some(downstream),
            pipeline_token,
            own_token: None,
        }
    }

    fn snapshot(&self, finalized: bool) -> Option<AggregationSnapshot> {
        self.aggregator
            .as_ref()
            .map(|aggregator| aggregator.snapshot(finalized))
    }

    /// Closes the downstream stream and stops this component.
    fn terminate(&mut self, ctx: &ComponentContext<Self>) {
        self.downstream = None;
        ctx.cancellation_token.cancel();
    }

    async fn on_chunk(&mut self, chunk: Chunk, degraded_mode: bool) {
        let chunk_bytes = chunk.records.weight();
        let Some(aggregator) = self.aggregator.as_mut() else {
            return;
        };
        let effect = aggregator.consume(&chunk);
        let state_bytes = aggregator.estimated_bytes();
        self.tracker.sub_in_flight(chunk_bytes);
        self.tracker.set_state_bytes(state_bytes);
        let records = chunk.len() as u64;
        self.tracker.update(|info| {
            info.records_aggregated += records;
            info.chunks_aggregated += 1;
        });

        let Some(downstream) = &self.downstream else {
            return;
        };
        let transformed = TransformedChunk {
            metadata: ChunkMetadata {
                groups_per_level: effect.groups_per_level,
                records_rejected: effect.records_rejected,
                degraded_mode,
                chunk_size: chunk.chunk_size,
            },
            chunk,
        };
        if downstream.send(transformed).await.is_err() {
            tracing::info!(
                stream_id = %self.stream_id,
                "Consumer detached, continuing with aggregation only"
            );
            self.downstream = None;
        }
    }
}

#[async_trait]
impl Component for TransformStage {
    fn get_name() -> &'static str {
        "TransformStage"
    }

    fn queue_size(&self) -> usize {
        self.queue_size
    }

    async fn on_start(&mut self, ctx: &ComponentContext<Self>) -> () {
        self.own_token = Some(ctx.cancellation_token.clone());
        if let Some(events) = self.events.take() {
            let events = futures::stream::unfold(events, |mut events| async move {
                events.recv().await.map(|event| (event, events))
            });
            self.register_stream(events, ctx);
        }
    }

    async fn on_stop(&mut self) -> Result<(), Box<dyn StrataError>> {
        // Stop and completion both end here; the frozen snapshot, if any, lives
        // in the tracker.
        self.aggregator = None;
        self.downstream = None;
        tracing::debug!(stream_id = %self.stream_id, "Transform stage stopped");
        Ok(())
    }

    fn on_handler_panic(&mut self, panic: Box<dyn core::any::Any + Send>) {
        let message = get_panic_message(&panic).unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(stream_id = %self.stream_id, "Transform stage panicked: {message}");
        self.tracker.finish(
            PipelineStatus::Failed,
            Some(format!("transform stage panicked: {message}")),
        );
        self.aggregator = None;
        self.downstream = None;
        self.pipeline_token.cancel();
        if let Some(token) = &self.own_token {
            token.cancel();
        }
    }
}

#[async_trait]
impl Handler<ProducerEvent> for TransformStage {
    type Result = ();

    async fn handle(&mut self, event: ProducerEvent, ctx: &ComponentContext<Self>) {
        match event {
            ProducerEvent::Chunk {
                chunk,
                degraded_mode,
            } => self.on_chunk(chunk, degraded_mode).await,
            ProducerEvent::Finished { total_records } => {
                if let Some(snapshot) = self.snapshot(true) {
                    self.tracker.publish_snapshot(snapshot);
                }
                if self.tracker.finish(PipelineStatus::Completed, None) {
                    tracing::info!(
                        stream_id = %self.stream_id,
                        total_records,
                        "Pipeline completed"
                    );
                }
                self.terminate(ctx);
            }
            ProducerEvent::Failed { reason } => {
                if let Some(snapshot) = self.snapshot(false) {
                    self.tracker.publish_snapshot(snapshot);
                }
                self.tracker.finish(PipelineStatus::Failed, Some(reason));
                self.terminate(ctx);
            }
        }
    }
}

impl StreamHandler<ProducerEvent> for TransformStage {}

#[async_trait]
impl Handler<SnapshotRequest> for TransformStage {
    type Result = Option<AggregationSnapshot>;

    async fn handle(
        &mut self,
        _message: SnapshotRequest,
        _ctx: &ComponentContext<Self>,
    ) -> Option<AggregationSnapshot> {
        self.snapshot(false)
    }
}
