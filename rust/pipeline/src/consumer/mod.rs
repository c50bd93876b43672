//! The contract between a pipeline and whatever consumes its chunks, plus
//! helpers consumers commonly need.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::errors::ConsumerError;
use crate::execution::ChunkStream;
use crate::types::{PipelineStatus, TransformedChunk};

mod buffer;
mod error_wrap;
mod progress;

pub use buffer::RecordBuffer;
pub use error_wrap::{ErrorHandler, ErrorWrapping};
pub use progress::{ProgressSummary, ProgressTracker};

/// A downstream sink. Chunks arrive in order and never overlap; `finalize`
/// runs only when the pipeline completed.
#[async_trait]
pub trait ChunkConsumer: Send {
    type State: Send;
    type Output: Send;

    fn initial_state(&self) -> Self::State;

    async fn consume_chunk(
        &mut self,
        chunk: TransformedChunk,
        state: Self::State,
    ) -> Result<Self::State, ConsumerError>;

    async fn finalize(&mut self, state: Self::State) -> Result<Self::Output, ConsumerError>;
}

/// Feeds every chunk of `chunks` to `consumer`, bounding each call by
/// `timeout`. Returns the state after the last chunk.
pub async fn consume_all<S, C>(
    chunks: &mut S,
    consumer: &mut C,
    timeout: Duration,
) -> Result<C::State, ConsumerError>
where
    S: Stream<Item = TransformedChunk> + Unpin,
    C: ChunkConsumer,
{
    let mut state = consumer.initial_state();
    while let Some(chunk) = chunks.next().await {
        state = match tokio::time::timeout(timeout, consumer.consume_chunk(chunk, state)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConsumerError::Timeout(timeout)),
        };
    }
    Ok(state)
}

/// Runs `consumer` over a pipeline's stream and finalizes it once the
/// pipeline completed. A failed or stopped pipeline surfaces as an error
/// instead of a partial output.
pub async fn drive_consumer<C>(
    mut stream: ChunkStream,
    mut consumer: C,
    timeout: Duration,
) -> Result<C::Output, ConsumerError>
where
    C: ChunkConsumer,
{
    let state = consume_all(&mut stream, &mut consumer, timeout).await?;
    let info = stream.info();
    match info.status {
        PipelineStatus::Completed => consumer.finalize(state).await,
        PipelineStatus::Stopped => Err(ConsumerError::PipelineStopped),
        PipelineStatus::Failed => Err(ConsumerError::PipelineFailed(
            info.error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        status => Err(ConsumerError::PipelineFailed(format!(
            "stream ended while the pipeline is {status}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkMetadata, Record};
    use std::sync::Arc;

    fn chunk(index: u64, size: usize) -> TransformedChunk {
        TransformedChunk {
            chunk: Chunk {
                chunk_index: index,
                chunk_size: size,
                offset: index * size as u64,
                total_processed_so_far: (index + 1) * size as u64,
                records: Arc::new(vec![Record::new(); size]),
            },
            metadata: ChunkMetadata::default(),
        }
    }

    struct Counting {
        fail_at: Option<u64>,
        stall_at: Option<u64>,
    }

    #[async_trait]
    impl ChunkConsumer for Counting {
        type State = (u64, Vec<u64>);
        type Output = u64;

        fn initial_state(&self) -> Self::State {
            (0, Vec::new())
        }

        async fn consume_chunk(
            &mut self,
            chunk: TransformedChunk,
            (count, mut seen): Self::State,
        ) -> Result<Self::State, ConsumerError> {
            let index = chunk.chunk.chunk_index;
            if self.fail_at == Some(index) {
                return Err(ConsumerError::Failed(format!("chunk {index} rejected")));
            }
            if self.stall_at == Some(index) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            seen.push(index);
            Ok((count + chunk.chunk.len() as u64, seen))
        }

        async fn finalize(&mut self, (count, _): Self::State) -> Result<u64, ConsumerError> {
            Ok(count)
        }
    }

    #[tokio::test]
    async fn consumes_chunks_in_order() {
        let mut chunks = futures::stream::iter((0..3).map(|i| chunk(i, 2)));
        let mut consumer = Counting {
            fail_at: None,
            stall_at: None,
        };
        let (count, seen) = consume_all(&mut chunks, &mut consumer, Duration::from_secs(1))
            .await
            .expect("all chunks consumed");
        assert_eq!(count, 6);
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn consumer_errors_stop_consumption() {
        let mut chunks = futures::stream::iter((0..3).map(|i| chunk(i, 2)));
        let mut consumer = Counting {
            fail_at: Some(1),
            stall_at: None,
        };
        assert_eq!(
            consume_all(&mut chunks, &mut consumer, Duration::from_secs(1))
                .await
                .err(),
            Some(ConsumerError::Failed("chunk 1 rejected".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumers_time_out() {
        let mut chunks = futures::stream::iter((0..3).map(|i| chunk(i, 2)));
        let mut consumer = Counting {
            fail_at: None,
            stall_at: Some(0),
        };
        assert_eq!(
            consume_all(&mut chunks, &mut consumer, Duration::from_millis(500))
                .await
                .err(),
            Some(ConsumerError::Timeout(Duration::from_millis(500)))
        );
    }
}
