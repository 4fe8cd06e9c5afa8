//! In-process [`UploadServer`] backed by a [`ChunkStore`].

use sliceup_engine::{ServerError, ServerFuture, UploadServer};
use sliceup_protocol::{
    CheckExistsRequest, CheckExistsResponse, InitUploadRequest, InitUploadResponse, MergeRequest,
    MergeResponse, UploadChunkRequest, UploadChunkResponse, UploadStatusResponse,
};
use tokio_util::sync::CancellationToken;

use crate::store::ChunkStore;

impl UploadServer for ChunkStore {
    fn init_upload(&self, request: InitUploadRequest) -> ServerFuture<'_, InitUploadResponse> {
        Box::pin(async move { Ok(ChunkStore::init_upload(self, request).await?) })
    }

    fn upload_chunk(
        &self,
        request: UploadChunkRequest,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> ServerFuture<'_, UploadChunkResponse> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ServerError::Cancelled),
                result = self.put_chunk(request, &data) => Ok(result?),
            }
        })
    }

    fn check_exists(&self, request: CheckExistsRequest) -> ServerFuture<'_, CheckExistsResponse> {
        Box::pin(async move { Ok(ChunkStore::check_exists(self, request).await?) })
    }

    fn merge_chunks(&self, request: MergeRequest) -> ServerFuture<'_, MergeResponse> {
        Box::pin(async move { Ok(self.merge(request).await?) })
    }

    fn upload_status(&self, slice_id: String) -> ServerFuture<'_, UploadStatusResponse> {
        Box::pin(async move { Ok(self.status(&slice_id)?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliceup_transfer::checksum_bytes;
    use tempfile::TempDir;

    #[tokio::test]
    async fn store_errors_keep_their_status() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();
        let server: &dyn UploadServer = &store;

        let err = server.upload_status("missing".into()).await.unwrap_err();
        assert!(matches!(err, ServerError::Status { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_chunk_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();
        let server: &dyn UploadServer = &store;
        let init = server
            .init_upload(InitUploadRequest {
                file_name: "a.bin".into(),
                file_size: 4,
                fingerprint: checksum_bytes(b"abcd"),
                chunk_size: 4,
            })
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let request = UploadChunkRequest {
            slice_id: init.slice_id.clone(),
            sequence: 0,
            chunk_count: 1,
            fingerprint: checksum_bytes(b"abcd"),
            file_name: "a.bin".into(),
            chunk_md5: String::new(),
        };
        let err = server.upload_chunk(request, b"abcd".to_vec(), token).await.unwrap_err();
        assert_eq!(err, ServerError::Cancelled);
        assert!(store.status(&init.slice_id).unwrap().uploaded_chunks.is_empty());
    }
}
