use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use sliceup_protocol::{FileRecord, TaskStatus};
use sliceup_transfer::{ChunkDescriptor, SpeedCalculator};
use tokio_util::sync::CancellationToken;

/// Opaque task identifier, caller-assigned or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A file to upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Generated when `None`.
    pub id: Option<TaskId>,
    /// Display name; defaults to the source file name.
    pub name: Option<String>,
    pub source: PathBuf,
}

impl UploadRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            name: None,
            source: source.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Session state saved by a previous run, used to resume without re-hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub fingerprint: String,
    pub slice_id: String,
}

/// Read-only view of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub source: PathBuf,
    pub size_bytes: u64,
    pub fingerprint: Option<String>,
    pub slice_id: Option<String>,
    pub chunk_size: u64,
    /// `None` until the chunk plan exists.
    pub chunk_count: Option<u64>,
    pub uploaded_chunks: Vec<u64>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub file_record: Option<FileRecord>,
}

impl TaskSnapshot {
    /// State needed to resume this upload from another process.
    pub fn resume_state(&self) -> Option<ResumeState> {
        Some(ResumeState {
            fingerprint: self.fingerprint.clone()?,
            slice_id: self.slice_id.clone()?,
        })
    }
}

/// Engine-side state of one task. Only the engine mutates it.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub source: PathBuf,
    pub size_bytes: u64,
    pub chunk_size: u64,
    /// Set once, never recomputed.
    pub fingerprint: Option<String>,
    pub slice_id: Option<String>,
    /// Empty until the session is ready.
    pub chunks: Vec<ChunkDescriptor>,
    /// Only server-acknowledged sequences; never shrinks.
    pub uploaded: BTreeSet<u64>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub cancel: CancellationToken,
    pub last_error: Option<String>,
    pub file_record: Option<FileRecord>,
    pub speed: SpeedCalculator,
}

impl TaskRecord {
    pub fn new(id: TaskId, name: String, source: PathBuf, size_bytes: u64, chunk_size: u64) -> Self {
        Self {
            id,
            name,
            source,
            size_bytes,
            chunk_size,
            fingerprint: None,
            slice_id: None,
            chunks: Vec::new(),
            uploaded: BTreeSet::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            cancel: CancellationToken::new(),
            last_error: None,
            file_record: None,
            speed: SpeedCalculator::default(),
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Planned chunks the server has not acknowledged yet.
    pub fn missing_chunks(&self) -> Vec<ChunkDescriptor> {
        self.chunks
            .iter()
            .filter(|c| !self.uploaded.contains(&c.sequence))
            .copied()
            .collect()
    }

    /// Bytes of the planned chunks not yet acknowledged.
    pub fn remaining_bytes(&self) -> u64 {
        self.missing_chunks().iter().map(|c| c.len()).sum()
    }

    pub fn all_uploaded(&self) -> bool {
        !self.chunks.is_empty() && self.uploaded.len() == self.chunks.len()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            source: self.source.clone(),
            size_bytes: self.size_bytes,
            fingerprint: self.fingerprint.clone(),
            slice_id: self.slice_id.clone(),
            chunk_size: self.chunk_size,
            chunk_count: (!self.chunks.is_empty()).then(|| self.chunk_count()),
            uploaded_chunks: self.uploaded.iter().copied().collect(),
            status: self.status,
            retry_count: self.retry_count,
            error: self.last_error.clone(),
            file_record: self.file_record.clone(),
        }
    }
}
