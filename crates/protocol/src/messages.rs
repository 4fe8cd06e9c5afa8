use serde::{Deserialize, Serialize};

use crate::types::{FileRecord, SessionStatus};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens a chunk session for a hashed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub fingerprint: String,
    pub chunk_size: u64,
}

/// Metadata sent alongside the bytes of one chunk.
///
/// Over HTTP these become multipart form fields next to the `file` part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub slice_id: String,
    pub sequence: u64,
    pub chunk_count: u64,
    pub fingerprint: String,
    pub file_name: String,
    /// Hex MD5 of the chunk bytes (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chunk_md5: String,
}

/// Asks whether content with this fingerprint is already stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckExistsRequest {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
}

/// Requests server-side assembly of all chunks of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub slice_id: String,
    pub fingerprint: String,
    pub chunk_count: u64,
    pub file_name: String,
    pub file_size: u64,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Response to [`InitUploadRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub slice_id: String,
    pub chunk_count: u64,
    /// Sequences the server already holds for this fingerprint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploaded_chunks: Vec<u64>,
}

/// Response to an [`UploadChunkRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub accepted: bool,
}

/// Response to [`CheckExistsRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckExistsResponse {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_record: Option<FileRecord>,
}

/// Response to [`MergeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub file_record: FileRecord,
}

/// Server view of a chunk session, used to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub chunk_total: u64,
    pub chunk_uploaded: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploaded_chunks: Vec<u64>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_record: Option<FileRecord>,
}
