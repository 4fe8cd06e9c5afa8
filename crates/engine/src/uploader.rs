use std::time::Duration;

use sliceup_protocol::UploadChunkRequest;
use sliceup_transfer::{ChunkDescriptor, ChunkReader, checksum_bytes};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ServerError, UploadError};
use crate::server::UploadServer;

/// Everything needed to transfer one chunk.
#[derive(Debug, Clone)]
pub(crate) struct ChunkJob {
    pub reader: ChunkReader,
    pub chunk: ChunkDescriptor,
    /// Metadata sent with the bytes; `chunk_md5` is filled in here.
    pub request: UploadChunkRequest,
    pub verify: bool,
}

/// Reads and transfers one chunk. Returns the number of bytes sent.
///
/// The chunk only counts as uploaded when the server acknowledges it. A
/// request that outlives `timeout` is reported as retryable.
pub(crate) async fn upload_chunk(
    server: &dyn UploadServer,
    job: ChunkJob,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<u64, UploadError> {
    let sequence = job.chunk.sequence;
    if cancel.is_cancelled() {
        return Err(UploadError::Cancelled);
    }

    let data = job.reader.read(&job.chunk).await.map_err(UploadError::Source)?;
    let len = data.len() as u64;

    let mut request = job.request;
    if job.verify {
        request.chunk_md5 = checksum_bytes(&data);
    }

    let response = tokio::time::timeout(timeout, server.upload_chunk(request, data, cancel.clone()))
        .await
        .unwrap_or(Err(ServerError::Timeout));

    match response {
        Ok(resp) if resp.accepted => {
            debug!(sequence, bytes = len, "chunk acknowledged");
            Ok(len)
        }
        Ok(_) => Err(classify(sequence, ServerError::Rejected { sequence })),
        Err(e) => Err(classify(sequence, e)),
    }
}

fn classify(sequence: u64, error: ServerError) -> UploadError {
    match error {
        ServerError::Cancelled => UploadError::Cancelled,
        e if e.is_retryable() => UploadError::ChunkRetryable {
            sequence,
            source: e,
        },
        e => UploadError::ChunkTerminal {
            sequence,
            source: e,
        },
    }
}
