use sliceup_engine::ServerError;
use sliceup_transfer::TransferError;

/// Errors from the chunk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("unknown upload session: {0}")]
    UnknownSession(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cannot merge, missing chunks {missing:?}")]
    MissingChunks { missing: Vec<u64> },

    #[error("assembled file hashes to {actual}, expected {expected}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("background task failed: {0}")]
    Join(String),
}

impl StoreError {
    /// HTTP-style status code reported to clients.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownSession(_) => 404,
            Self::InvalidRequest(_)
            | Self::Transfer(
                TransferError::ChecksumMismatch { .. }
                | TransferError::InvalidPath(_)
                | TransferError::InvalidChunkSize
                | TransferError::ChunkTooLarge { .. },
            ) => 400,
            Self::MissingChunks { .. } => 409,
            Self::FingerprintMismatch { .. } => 422,
            Self::Io(_) | Self::Json(_) | Self::Transfer(_) | Self::Join(_) => 500,
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Status {
            status: e.status_code(),
            message: e.to_string(),
        }
    }
}
