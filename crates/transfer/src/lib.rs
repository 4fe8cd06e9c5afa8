//! Content fingerprinting and chunk I/O for resumable uploads.
//!
//! - [`hasher`] streams a file through MD5 in fixed batches.
//! - [`chunked`] plans the ordered chunk set of a file, reads one chunk for
//!   transfer and writes received chunks back at their offsets.
//! - [`progress`] maps phase ratios onto one monotonic percentage and
//!   measures transfer rate.

mod chunked;
mod hasher;
mod progress;
mod validation;

pub use chunked::{ChunkDescriptor, ChunkReader, ChunkWriter, chunk_count, plan};
pub use hasher::{HashProgress, checksum_bytes, digest_file, digest_reader, verify_checksum};
pub use progress::{
    HASH_PHASE_END, SpeedCalculator, format_eta, format_rate, hashing_percent, upload_percent,
};
pub use validation::validate_file_name;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default hashing batch size: 2 MiB.
pub const DEFAULT_HASH_BATCH_SIZE: usize = 2 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("source changed: expected {expected} bytes, found {actual}")]
    SourceChanged { expected: u64, actual: u64 },

    #[error("chunk {sequence} is {len} bytes, larger than chunk size {chunk_size}")]
    ChunkTooLarge {
        sequence: u64,
        len: u64,
        chunk_size: u64,
    },

    #[error("checksum mismatch for chunk {sequence}")]
    ChecksumMismatch { sequence: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
