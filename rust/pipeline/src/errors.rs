use std::time::Duration;

use strata_error::{ErrorCodes, StrataError};
use strata_system::PanicError;
use thiserror::Error;

use crate::loader::LoaderError;
use crate::types::{PipelineStatus, StreamId};

/// Errors returned by a `DataSource`.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SourceError {
    #[error("Transient source error: {0}")]
    Transient(String),
    #[error("Source error: {0}")]
    Fatal(String),
    #[error("Source call timed out after {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_) | SourceError::Timeout(_))
    }
}

impl StrataError for SourceError {
    fn code(&self) -> ErrorCodes {
        match self {
            SourceError::Transient(_) => ErrorCodes::Unavailable,
            SourceError::Fatal(_) => ErrorCodes::Internal,
            SourceError::Timeout(_) => ErrorCodes::DeadlineExceeded,
        }
    }
}

/// Errors reported by a `ChunkConsumer` or by the driver running it.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConsumerError {
    #[error("Consumer failed: {0}")]
    Failed(String),
    #[error("Consumer did not handle a chunk within {0:?}")]
    Timeout(Duration),
    #[error("Consumer panicked: {0}")]
    Panicked(String),
    #[error("Pipeline failed: {0}")]
    PipelineFailed(String),
    #[error("Pipeline was stopped before it completed")]
    PipelineStopped,
    #[error("Consumer gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },
}

impl From<PanicError> for ConsumerError {
    fn from(panic: PanicError) -> Self {
        ConsumerError::Panicked(panic.message())
    }
}

impl StrataError for ConsumerError {
    fn code(&self) -> ErrorCodes {
        match self {
            ConsumerError::Failed(_) => ErrorCodes::Internal,
            ConsumerError::Timeout(_) => ErrorCodes::DeadlineExceeded,
            ConsumerError::Panicked(_) => ErrorCodes::Aborted,
            ConsumerError::PipelineFailed(_) => ErrorCodes::Internal,
            ConsumerError::PipelineStopped => ErrorCodes::Cancelled,
            ConsumerError::RetriesExhausted { .. } => ErrorCodes::Unavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error("Fetch failed after {attempts} attempts: {source}")]
    FetchFailed { attempts: usize, source: SourceError },
    #[error("Memory usage {used} bytes exceeds the limit of {limit} bytes at the minimum chunk size")]
    ResourceExhausted { used: usize, limit: usize },
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error("Pipeline {0} not found")]
    NotFound(StreamId),
    #[error("Cannot {action} pipeline {stream_id} while it is {status}")]
    InvalidTransition {
        stream_id: StreamId,
        status: PipelineStatus,
        action: &'static str,
    },
    #[error("Pipeline {stream_id} has not completed, it is {status}")]
    NotCompleted {
        stream_id: StreamId,
        status: PipelineStatus,
    },
    #[error("Aggregation state of pipeline {0} was released")]
    StateReleased(StreamId),
    #[error("Pipeline stage failed: {0}")]
    Stage(String),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("Pipeline ended as {status}: {reason}")]
    Terminated {
        status: PipelineStatus,
        reason: String,
    },
    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl StrataError for PipelineError {
    fn code(&self) -> ErrorCodes {
        match self {
            PipelineError::InvalidConfig(_) => ErrorCodes::InvalidArgument,
            PipelineError::Loader(e) => e.code(),
            PipelineError::FetchFailed { .. } => ErrorCodes::Unavailable,
            PipelineError::ResourceExhausted { .. } => ErrorCodes::ResourceExhausted,
            PipelineError::Consumer(e) => e.code(),
            PipelineError::NotFound(_) => ErrorCodes::NotFound,
            PipelineError::InvalidTransition { .. } => ErrorCodes::FailedPrecondition,
            PipelineError::NotCompleted { .. } => ErrorCodes::FailedPrecondition,
            PipelineError::StateReleased(_) => ErrorCodes::FailedPrecondition,
            PipelineError::Stage(_) => ErrorCodes::Internal,
            PipelineError::Timeout(_, _) => ErrorCodes::DeadlineExceeded,
            PipelineError::Terminated { .. } => ErrorCodes::Aborted,
            PipelineError::ShuttingDown => ErrorCodes::Unavailable,
        }
    }

    fn should_trace_error(&self) -> bool {
        !matches!(
            self,
            PipelineError::NotFound(_) | PipelineError::InvalidTransition { .. }
        )
    }
}
