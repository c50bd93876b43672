use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use futures::FutureExt;
use strata_system::PanicError;

use crate::errors::ConsumerError;
use crate::types::TransformedChunk;

/// Decides what happens once a chunk failed every attempt. It receives the
/// last error and the state from before the chunk; returning `Ok` skips the
/// chunk with that state.
pub type ErrorHandler<S> = Box<dyn Fn(ConsumerError, S) -> Result<S, ConsumerError> + Send + Sync>;

/// Wraps a raw consume function so that errors and panics are retried with a
/// constant delay before being handed to an error handler.
pub struct ErrorWrapping<F, S> {
    consume: F,
    max_retries: usize,
    retry_delay: Duration,
    on_error: Option<ErrorHandler<S>>,
}

impl<F, Fut, S> ErrorWrapping<F, S>
where
    F: Fn(TransformedChunk, S) -> Fut + Send + Sync,
    Fut: Future<Output = Result<S, ConsumerError>> + Send,
    S: Clone + Send + Sync,
{
    pub fn new(consume: F) -> Self {
        Self {
            consume,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            on_error: None,
        }
    }

    pub fn with_retries(mut self, max_retries: usize, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn on_error(
        mut self,
        handler: impl Fn(ConsumerError, S) -> Result<S, ConsumerError> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Consumes `chunk`. Without a handler, a chunk that failed every attempt
    /// yields `ConsumerError::RetriesExhausted`.
    pub async fn call(&self, chunk: TransformedChunk, state: S) -> Result<S, ConsumerError> {
        let attempts = AtomicUsize::new(0);
        let backoff = ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(self.max_retries);
        let chunk_index = chunk.chunk.chunk_index;

        let result = (|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            self.attempt(chunk.clone(), state.clone())
        })
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .notify(|e: &ConsumerError, delay: Duration| {
            tracing::warn!(chunk_index, "Consumer failed, retrying in {delay:?}: {e}");
        })
        .await;

        match result {
            Ok(state) => Ok(state),
            Err(error) => match &self.on_error {
                Some(handler) => handler(error, state),
                None => Err(ConsumerError::RetriesExhausted {
                    attempts: attempts.load(Ordering::SeqCst),
                    last_error: error.to_string(),
                }),
            },
        }
    }

    async fn attempt(&self, chunk: TransformedChunk, state: S) -> Result<S, ConsumerError> {
        // The function may panic before it hands back a future.
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| (self.consume)(chunk, state)))
            .map_err(PanicError::new)?;
        AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .map_err(PanicError::new)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkMetadata, Record};
    use std::sync::Arc;

    fn chunk(size: usize) -> TransformedChunk {
        TransformedChunk {
            chunk: Chunk {
                chunk_index: 0,
                chunk_size: size,
                offset: 0,
                total_processed_so_far: size as u64,
                records: Arc::new(vec![Record::new(); size]),
            },
            metadata: ChunkMetadata::default(),
        }
    }

    fn failing_first(
        failures: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(TransformedChunk, u64) -> futures::future::BoxFuture<'static, Result<u64, ConsumerError>>
           + Send
           + Sync {
        move |chunk: TransformedChunk, count: u64| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(ConsumerError::Failed("flaky sink".to_string()))
                } else {
                    Ok(count + chunk.chunk.len() as u64)
                }
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_the_retry_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = ErrorWrapping::new(failing_first(2, calls.clone()))
            .with_retries(2, Duration::from_millis(50));

        assert_eq!(wrapped.call(chunk(3), 10).await, Ok(13));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_the_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = ErrorWrapping::new(failing_first(usize::MAX, calls.clone()))
            .with_retries(2, Duration::from_millis(50));

        assert_eq!(
            wrapped.call(chunk(3), 0).await,
            Err(ConsumerError::RetriesExhausted {
                attempts: 3,
                last_error: "Consumer failed: flaky sink".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn handler_can_skip_a_failed_chunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = ErrorWrapping::new(failing_first(usize::MAX, calls.clone()))
            .on_error(|_, state| Ok(state));

        assert_eq!(wrapped.call(chunk(3), 7).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panics_are_caught_like_errors() {
        let sync_panic = ErrorWrapping::new(|_: TransformedChunk, _: u64| -> futures::future::Ready<Result<u64, ConsumerError>> {
            panic!("sink exploded")
        });
        match sync_panic.call(chunk(1), 0).await {
            Err(ConsumerError::RetriesExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("sink exploded"));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }

        let async_panic = ErrorWrapping::new(|_: TransformedChunk, state: u64| async move {
            if state == 0 {
                panic!("sink exploded later");
            }
            Ok::<_, ConsumerError>(state)
        })
        .on_error(|error, _| Err(error));
        assert_eq!(
            async_panic.call(chunk(1), 0).await,
            Err(ConsumerError::Panicked("sink exploded later".to_string()))
        );
    }
}
