use serde::{Deserialize, Serialize};

/// Code carried by a successful envelope.
pub const CODE_OK: i32 = 200;

/// Error extracted from a non-successful envelope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("server error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("envelope has no data")]
    MissingData,
}

/// Response envelope wrapping every server reply.
///
/// `code` follows HTTP semantics (200 success, 4xx caller error, 5xx server
/// error) even when the transport status itself was 200.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i32,
    #[serde(default, alias = "message")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Wraps a successful payload.
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_OK,
            msg: String::new(),
            data: Some(data),
        }
    }

    /// Creates an error envelope without data.
    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }

    /// Returns `true` if the envelope reports success.
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Unwraps the payload, turning error codes into [`EnvelopeError`].
    pub fn into_result(self) -> Result<T, EnvelopeError> {
        if !self.is_ok() {
            return Err(EnvelopeError::Remote {
                code: self.code,
                message: self.msg,
            });
        }
        self.data.ok_or(EnvelopeError::MissingData)
    }
}
