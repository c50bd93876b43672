use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use super::tracker::PipelineTracker;
use crate::errors::PipelineError;
use crate::types::{PipelineInfo, PipelineStatus, StreamId, TransformedChunk};

/// Credits a consumer hands to the producer, one per chunk it is ready for.
/// A detached gate lets the producer run without credits.
#[derive(Clone, Debug)]
pub(crate) struct DemandGate {
    credits: Arc<Semaphore>,
}

/// Permission to emit one chunk. Dropping an unused credit returns it.
#[derive(Debug)]
pub(crate) struct DemandCredit(OwnedSemaphorePermit);

impl DemandCredit {
    pub(crate) fn consume(self) {
        self.0.forget();
    }
}

impl DemandGate {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            credits: Arc::new(Semaphore::new(initial)),
        }
    }

    /// Waits for a credit. `None` means the consumer detached and the
    /// producer should carry on unthrottled.
    pub(crate) async fn acquire(&self) -> Option<DemandCredit> {
        self.credits.clone().acquire_owned().await.ok().map(DemandCredit)
    }

    pub(crate) fn grant(&self, credits: usize) {
        if !self.credits.is_closed() {
            self.credits.add_permits(credits);
        }
    }

    pub(crate) fn detach(&self) {
        self.credits.close();
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.credits.available_permits()
    }
}

/// The transformed chunks of one pipeline, in order.
///
/// Every chunk taken from the stream grants the producer one more credit.
/// Dropping the stream detaches the consumer: the pipeline keeps aggregating
/// and chunks are no longer delivered.
#[derive(Debug)]
pub struct ChunkStream {
    stream_id: StreamId,
    receiver: mpsc::Receiver<TransformedChunk>,
    gate: DemandGate,
    tracker: Arc<PipelineTracker>,
}

impl ChunkStream {
    pub(crate) fn new(
        receiver: mpsc::Receiver<TransformedChunk>,
        gate: DemandGate,
        tracker: Arc<PipelineTracker>,
    ) -> Self {
        Self {
            stream_id: tracker.stream_id(),
            receiver,
            gate,
            tracker,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn status(&self) -> PipelineStatus {
        self.tracker.status()
    }

    pub fn info(&self) -> PipelineInfo {
        self.tracker.info()
    }

    /// How the pipeline ended, once the stream is exhausted. `Ok` only for a
    /// completed pipeline.
    pub fn outcome(&self) -> Result<(), PipelineError> {
        let info = self.tracker.info();
        match info.status {
            PipelineStatus::Completed => Ok(()),
            PipelineStatus::Failed | PipelineStatus::Stopped => Err(PipelineError::Terminated {
                status: info.status,
                reason: info
                    .error
                    .unwrap_or_else(|| format!("pipeline {}", info.status)),
            }),
            PipelineStatus::Running | PipelineStatus::Paused => Err(PipelineError::Stage(
                format!("stream of pipeline {} ended while it is {}", self.stream_id, info.status),
            )),
        }
    }
}

impl Stream for ChunkStream {
    type Item = TransformedChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.receiver.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.gate.grant(1);
        }
        polled
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.gate.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkMetadata};
    use futures::StreamExt;

    fn chunk(index: u64) -> TransformedChunk {
        TransformedChunk {
            chunk: Chunk {
                chunk_index: index,
                chunk_size: 0,
                offset: 0,
                total_processed_so_far: 0,
                records: Arc::new(Vec::new()),
            },
            metadata: ChunkMetadata::default(),
        }
    }

    #[tokio::test]
    async fn unused_credits_return_to_the_gate() {
        let gate = DemandGate::new(1);
        let credit = gate.acquire().await.expect("gate open");
        assert_eq!(gate.available(), 0);
        drop(credit);
        assert_eq!(gate.available(), 1);
        gate.acquire().await.expect("gate open").consume();
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test]
    async fn reading_grants_credits_and_dropping_detaches() {
        let tracker = Arc::new(PipelineTracker::new(StreamId::new(), 10));
        let gate = DemandGate::new(2);
        let (tx, rx) = mpsc::channel(4);
        let mut stream = ChunkStream::new(rx, gate.clone(), tracker);

        gate.acquire().await.expect("credit").consume();
        tx.send(chunk(0)).await.expect("stream alive");
        assert_eq!(gate.available(), 1);
        assert_eq!(stream.next().await.map(|c| c.chunk.chunk_index), Some(0));
        assert_eq!(gate.available(), 2);

        drop(stream);
        assert!(gate.acquire().await.is_none());
        assert!(tx.send(chunk(1)).await.is_err());
    }

    #[tokio::test]
    async fn outcome_reflects_the_pipeline_status() {
        let tracker = Arc::new(PipelineTracker::new(StreamId::new(), 10));
        let (tx, rx) = mpsc::channel(1);
        let mut stream = ChunkStream::new(rx, DemandGate::new(1), tracker.clone());
        tracker.finish(PipelineStatus::Failed, Some("source down".to_string()));
        drop(tx);
        assert!(stream.next().await.is_none());
        match stream.outcome() {
            Err(PipelineError::Terminated { status, reason }) => {
                assert_eq!(status, PipelineStatus::Failed);
                assert_eq!(reason, "source down");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
