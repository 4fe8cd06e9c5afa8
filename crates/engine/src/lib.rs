//! Chunked, resumable, content-addressed upload engine.
//!
//! Files are fingerprinted with MD5, checked against the server for an
//! existing copy, split into fixed-size chunks and uploaded through one FIFO
//! queue under a shared concurrency limit. Acknowledged chunks are never
//! sent again; failed units back off exponentially; a task finishes with a
//! server-side merge.
//!
//! ```no_run
//! # async fn run(server: std::sync::Arc<dyn sliceup_engine::UploadServer>) -> Result<(), sliceup_engine::EngineError> {
//! use sliceup_engine::{EngineConfig, UploadEngine, UploadRequest};
//!
//! let engine = UploadEngine::new(EngineConfig::default(), server)?;
//! engine.enqueue(vec![UploadRequest::new("/data/video.mp4")])?;
//! engine.wait_idle().await;
//! for entry in engine.status() {
//!     println!("{} {:.0}% {}", entry.file_name, entry.progress_percent, entry.lifecycle_status);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod dedup;
mod engine;
mod error;
mod merge;
#[cfg(test)]
mod mock;
mod prepare;
mod scheduler;
mod server;
mod status;
mod task;
mod uploader;

pub use config::{ConcurrencyScope, DedupPolicy, EngineConfig, MergeMode, RetryPolicy};
pub use engine::UploadEngine;
pub use error::{EngineError, ServerError, UploadError};
pub use scheduler::SchedulerStats;
pub use server::{ServerFuture, UploadServer};
pub use status::{StatusEvent, StatusStore};
pub use task::{ResumeState, TaskId, TaskSnapshot, UploadRequest};
