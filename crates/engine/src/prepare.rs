//! First unit of every task: fingerprint, dedup check and session setup.

use std::path::PathBuf;

use sliceup_protocol::{FileRecord, InitUploadRequest, SessionStatus};
use sliceup_transfer::{HashProgress, digest_reader};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dedup::{self, DedupOutcome};
use crate::error::{ServerError, UploadError};
use crate::server::UploadServer;
use crate::task::TaskId;

/// Task fields the prepare unit needs, copied out of the task record.
#[derive(Debug, Clone)]
pub(crate) struct PrepareInput {
    pub task: TaskId,
    pub name: String,
    pub source: PathBuf,
    pub size_bytes: u64,
    /// Known when resuming or retrying; skips hashing.
    pub fingerprint: Option<String>,
    /// Known when resuming or retrying; reuses the session.
    pub slice_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Prepared {
    /// Nothing to transfer; the server already has the content.
    Duplicate {
        fingerprint: String,
        record: FileRecord,
    },
    /// Session is open; `server_chunks` are already stored server-side.
    Ready {
        fingerprint: String,
        slice_id: String,
        chunk_count: u64,
        server_chunks: Vec<u64>,
    },
}

/// Streams the source through MD5. The file must still be the size it had
/// at enqueue.
pub(crate) async fn hash<F>(
    input: &PrepareInput,
    batch_size: usize,
    on_hash: F,
) -> Result<String, UploadError>
where
    F: FnMut(HashProgress) + Send,
{
    debug!(task = %input.task, path = %input.source.display(), "hashing");
    let file = tokio::fs::File::open(&input.source)
        .await
        .map_err(|e| UploadError::HashFailure(e.into()))?;
    let fingerprint = digest_reader(file, input.size_bytes, batch_size, on_hash)
        .await
        .map_err(UploadError::HashFailure)?;
    debug!(task = %input.task, fingerprint = %fingerprint, "hash complete");
    Ok(fingerprint)
}

/// Dedup check and session setup for a hashed task.
///
/// A known `slice_id` is reopened first; dedup and `InitUpload` only run
/// when there is no usable session.
pub(crate) async fn open_session(
    server: &dyn UploadServer,
    config: &EngineConfig,
    input: &PrepareInput,
    fingerprint: String,
) -> Result<Prepared, UploadError> {
    if let Some(slice_id) = input.slice_id.as_deref() {
        if let Some(prepared) = reopen_session(server, input, &fingerprint, slice_id).await? {
            return Ok(prepared);
        }
    }

    match dedup::check(
        server,
        config.dedup,
        &fingerprint,
        &input.name,
        input.size_bytes,
    )
    .await?
    {
        DedupOutcome::Duplicate(record) => {
            info!(task = %input.task, fingerprint = %fingerprint, "duplicate content, skipping upload");
            return Ok(Prepared::Duplicate {
                fingerprint,
                record,
            });
        }
        DedupOutcome::Proceed => {}
    }

    let request = InitUploadRequest {
        file_name: input.name.clone(),
        file_size: input.size_bytes,
        fingerprint: fingerprint.clone(),
        chunk_size: config.chunk_size,
    };
    let resp = server.init_upload(request).await.map_err(init_error)?;
    info!(
        task = %input.task,
        slice = %resp.slice_id,
        chunks = resp.chunk_count,
        already_stored = resp.uploaded_chunks.len(),
        "upload session opened"
    );
    Ok(Prepared::Ready {
        fingerprint,
        slice_id: resp.slice_id,
        chunk_count: resp.chunk_count,
        server_chunks: resp.uploaded_chunks,
    })
}

/// Asks the server about an existing session.
///
/// Returns `None` when the session is gone and a fresh one must be opened.
async fn reopen_session(
    server: &dyn UploadServer,
    input: &PrepareInput,
    fingerprint: &str,
    slice_id: &str,
) -> Result<Option<Prepared>, UploadError> {
    match server.upload_status(slice_id.to_string()).await {
        Ok(status) => match status.status {
            SessionStatus::Merged => {
                info!(task = %input.task, slice = slice_id, "session already merged");
                let prepared = match status.file_record {
                    Some(record) => Prepared::Duplicate {
                        fingerprint: fingerprint.to_string(),
                        record,
                    },
                    // Merge is idempotent; asking again returns the record.
                    None => Prepared::Ready {
                        fingerprint: fingerprint.to_string(),
                        slice_id: slice_id.to_string(),
                        chunk_count: status.chunk_total,
                        server_chunks: (0..status.chunk_total).collect(),
                    },
                };
                Ok(Some(prepared))
            }
            SessionStatus::Uploading => {
                info!(
                    task = %input.task,
                    slice = slice_id,
                    uploaded = status.chunk_uploaded,
                    total = status.chunk_total,
                    "resuming session"
                );
                Ok(Some(Prepared::Ready {
                    fingerprint: fingerprint.to_string(),
                    slice_id: slice_id.to_string(),
                    chunk_count: status.chunk_total,
                    server_chunks: status.uploaded_chunks,
                }))
            }
        },
        Err(ServerError::Cancelled) => Err(UploadError::Cancelled),
        Err(e) if e.is_retryable() => Err(UploadError::InitFailure(e)),
        Err(e) => {
            warn!(task = %input.task, slice = slice_id, error = %e, "session not resumable, opening a new one");
            Ok(None)
        }
    }
}

fn init_error(e: ServerError) -> UploadError {
    match e {
        ServerError::Cancelled => UploadError::Cancelled,
        e => UploadError::InitFailure(e),
    }
}
