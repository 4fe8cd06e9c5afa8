//! Server contract seam.
//!
//! `UploadServer` is implemented over HTTP by `sliceup-http` and in-process by
//! `sliceup-store`. Keeping the contract behind a trait keeps the engine
//! decoupled from any transport and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use sliceup_protocol::{
    CheckExistsRequest, CheckExistsResponse, InitUploadRequest, InitUploadResponse, MergeRequest,
    MergeResponse, UploadChunkRequest, UploadChunkResponse, UploadStatusResponse,
};
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

/// Boxed future returned by [`UploadServer`] operations.
pub type ServerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ServerError>> + Send + 'a>>;

/// The remote side of a chunked upload.
pub trait UploadServer: Send + Sync {
    /// Opens (or reopens) the chunk session for a fingerprint.
    fn init_upload(&self, request: InitUploadRequest) -> ServerFuture<'_, InitUploadResponse>;

    /// Transfers the bytes of one chunk.
    ///
    /// Implementations abort the in-flight request when `cancel` fires and
    /// return [`ServerError::Cancelled`].
    fn upload_chunk(
        &self,
        request: UploadChunkRequest,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> ServerFuture<'_, UploadChunkResponse>;

    /// Asks whether content with this fingerprint is already stored.
    fn check_exists(&self, request: CheckExistsRequest) -> ServerFuture<'_, CheckExistsResponse>;

    /// Assembles a session's chunks. Must be idempotent.
    fn merge_chunks(&self, request: MergeRequest) -> ServerFuture<'_, MergeResponse>;

    /// Reports the server's view of a chunk session.
    fn upload_status(&self, slice_id: String) -> ServerFuture<'_, UploadStatusResponse>;
}
