//! Engine error types.

use std::path::PathBuf;

use sliceup_protocol::{EnvelopeError, TaskStatus};
use sliceup_transfer::TransferError;

use crate::task::TaskId;

/// Outcome of one failed round-trip to the upload server.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("chunk {sequence} was not accepted")]
    Rejected { sequence: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}

impl ServerError {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, timeouts, 5xx, 408, 429 and unacknowledged chunks
    /// are retryable. Other 4xx (bad session, quota) and malformed replies
    /// are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Rejected { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Protocol(_) | Self::Cancelled => false,
        }
    }
}

impl From<EnvelopeError> for ServerError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::Remote { code, message } => Self::Status {
                status: u16::try_from(code).unwrap_or(500),
                message,
            },
            EnvelopeError::MissingData => Self::Protocol("response envelope has no data".into()),
        }
    }
}

/// Failure attached to one upload task.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Hashing aborted; the task must hash again from scratch.
    #[error("hashing failed: {0}")]
    HashFailure(#[source] TransferError),

    /// Only surfaced when dedup is configured fail-closed.
    #[error("dedup check failed: {0}")]
    DedupCheckFailure(#[source] ServerError),

    #[error("session init failed: {0}")]
    InitFailure(#[source] ServerError),

    #[error("chunk {sequence} failed: {source}")]
    ChunkRetryable { sequence: u64, source: ServerError },

    #[error("chunk {sequence} rejected: {source}")]
    ChunkTerminal { sequence: u64, source: ServerError },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<UploadError>,
    },

    #[error("merge failed: {0}")]
    MergeFailure(#[source] ServerError),

    #[error("source file: {0}")]
    Source(#[source] TransferError),

    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    /// Whether the scheduler may re-queue the failed unit.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ChunkRetryable { .. } => true,
            Self::InitFailure(e) | Self::MergeFailure(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors returned by [`UploadEngine`](crate::UploadEngine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("cannot {operation} task {task} while {status}")]
    InvalidState {
        task: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
