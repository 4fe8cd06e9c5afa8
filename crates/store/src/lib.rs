//! Reference server side of the chunked upload contract.
//!
//! [`ChunkStore`] keeps upload sessions and their chunks in a local
//! directory, verifies chunk checksums, assembles merged files by sequence
//! and indexes them by fingerprint for dedup. It implements
//! [`sliceup_engine::UploadServer`] directly, so the engine can upload into
//! it in-process.

mod error;
mod server;
mod session;
mod store;

pub use error::StoreError;
pub use session::Session;
pub use store::{ChunkStore, CleanupReport};
