use std::time::Duration;

use serde::{Deserialize, Serialize};
use sliceup_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_HASH_BATCH_SIZE};

use crate::error::EngineError;

/// Whether `concurrency_limit` applies across all tasks or to each task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyScope {
    #[default]
    Global,
    PerTask,
}

/// When the merge request is sent once every chunk is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMode {
    /// Merge immediately.
    #[default]
    Automatic,
    /// Park the task in `awaiting-merge` until [`merge_task`](crate::UploadEngine::merge_task).
    Manual,
}

/// What to do when the dedup check itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Never ask the server.
    Disabled,
    /// Treat a failed check as "not found" and upload.
    #[default]
    FailOpen,
    /// Fail the task when the check fails.
    FailClosed,
}

/// Retry budget and backoff for retryable failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-queuing a unit that has already been retried
    /// `retry_count` times: `min(base * 2^retry_count, max)`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Upload engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub chunk_size: u64,
    pub hash_batch_size: usize,
    pub concurrency_limit: usize,
    pub concurrency_scope: ConcurrencyScope,
    pub retry: RetryPolicy,
    pub merge_mode: MergeMode,
    pub merge_max_retries: u32,
    pub dedup: DedupPolicy,
    /// Network timeout of a single chunk upload.
    pub chunk_timeout: Duration,
    /// Send the MD5 of every chunk so the server can verify it.
    pub verify_chunks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_batch_size: DEFAULT_HASH_BATCH_SIZE,
            concurrency_limit: 3,
            concurrency_scope: ConcurrencyScope::default(),
            retry: RetryPolicy::default(),
            merge_mode: MergeMode::default(),
            merge_max_retries: 2,
            dedup: DedupPolicy::default(),
            chunk_timeout: Duration::from_secs(60),
            verify_chunks: true,
        }
    }
}

impl EngineConfig {
    /// Rejects settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.hash_batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "hash_batch_size must be > 0".into(),
            ));
        }
        if self.concurrency_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "concurrency_limit must be > 0".into(),
            ));
        }
        if self.chunk_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "chunk_timeout must be > 0".into(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(EngineError::InvalidConfig(
                "retry base_delay exceeds max_delay".into(),
            ));
        }
        Ok(())
    }
}
