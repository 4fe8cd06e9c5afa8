//! Wire types shared by the upload engine, its HTTP client and the
//! reference chunk store.
//!
//! Field names are camelCase on the wire. Every server reply is wrapped in an
//! [`ApiEnvelope`].

pub mod envelope;
pub mod messages;
pub mod types;

pub use envelope::{ApiEnvelope, CODE_OK, EnvelopeError};
pub use messages::{
    CheckExistsRequest, CheckExistsResponse, InitUploadRequest, InitUploadResponse, MergeRequest,
    MergeResponse, UploadChunkRequest, UploadChunkResponse, UploadStatusResponse,
};
pub use types::{FileRecord, QueueStatusEntry, SessionStatus, TaskStatus};
