use sliceup_protocol::{FileRecord, MergeRequest};
use tracing::info;

use crate::error::{ServerError, UploadError};
use crate::server::UploadServer;

/// Asks the server to assemble a fully uploaded session.
///
/// The server treats repeated merges of the same session as success, so a
/// merge whose outcome is unknown (timeout) can be sent again.
pub(crate) async fn merge(
    server: &dyn UploadServer,
    request: MergeRequest,
) -> Result<FileRecord, UploadError> {
    let slice_id = request.slice_id.clone();
    info!(slice = %slice_id, chunks = request.chunk_count, "requesting merge");
    match server.merge_chunks(request).await {
        Ok(resp) => {
            info!(slice = %slice_id, file_id = %resp.file_record.file_id, "merge complete");
            Ok(resp.file_record)
        }
        Err(ServerError::Cancelled) => Err(UploadError::Cancelled),
        Err(e) => Err(UploadError::MergeFailure(e)),
    }
}
