use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sliceup_protocol::{FileRecord, SessionStatus, UploadStatusResponse};

/// One chunk session, persisted as `sessions/<slice_id>/session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub slice_id: String,
    pub fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_record: Option<FileRecord>,
    /// Rebuilt from the chunk directory on load.
    #[serde(skip)]
    pub uploaded: BTreeSet<u64>,
}

impl Session {
    pub fn new(
        slice_id: String,
        fingerprint: String,
        file_name: String,
        file_size: u64,
        chunk_size: u64,
        chunk_count: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            slice_id,
            fingerprint,
            file_name,
            file_size,
            chunk_size,
            chunk_count,
            status: SessionStatus::Uploading,
            created_at: now,
            updated_at: now,
            file_record: None,
            uploaded: BTreeSet::new(),
        }
    }

    /// Expected byte length of chunk `sequence`.
    pub fn chunk_len(&self, sequence: u64) -> u64 {
        let start = sequence.saturating_mul(self.chunk_size);
        self.file_size.saturating_sub(start).min(self.chunk_size)
    }

    /// Sequences in `0..chunk_count` not stored yet.
    pub fn missing(&self) -> Vec<u64> {
        (0..self.chunk_count)
            .filter(|s| !self.uploaded.contains(s))
            .collect()
    }

    /// Whether a new upload of the same content can reuse this session.
    pub fn matches(&self, fingerprint: &str, file_size: u64, chunk_size: u64) -> bool {
        self.status == SessionStatus::Uploading
            && self.fingerprint == fingerprint
            && self.file_size == file_size
            && self.chunk_size == chunk_size
    }

    pub fn to_status(&self) -> UploadStatusResponse {
        let uploaded_chunks: Vec<u64> = match self.status {
            SessionStatus::Uploading => self.uploaded.iter().copied().collect(),
            SessionStatus::Merged => (0..self.chunk_count).collect(),
        };
        UploadStatusResponse {
            chunk_total: self.chunk_count,
            chunk_uploaded: uploaded_chunks.len() as u64,
            uploaded_chunks,
            status: self.status,
            file_record: self.file_record.clone(),
        }
    }
}
