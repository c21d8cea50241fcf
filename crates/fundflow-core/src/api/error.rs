use thiserror::Error;

use crate::models::ErrorBody;
use crate::storage::StoreError;

/// Fallback message when a failed response carries no usable detail
pub const DEFAULT_ERROR_MESSAGE: &str = "An error occurred";

/// Fallback message when the session could not be renewed
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired";

#[derive(Error, Debug)]
pub enum ApiError {
    /// Non-success response other than an unrecoverable 401
    #[error("{message}")]
    Request { status: u16, message: String },

    /// The session was invalidated and local credentials were cleared
    #[error("{0}")]
    SessionExpired(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("Failed to encode request body: {0}")]
    Encode(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Error for a final non-success response.
    ///
    /// A 401 at this point is terminal for the session.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = ErrorBody::detail_from(body).unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
        match status {
            401 => ApiError::SessionExpired(message),
            _ => ApiError::Request { status, message },
        }
    }

    /// Error for a 401 that could not be recovered by a refresh
    pub fn session_expired(body: &str) -> Self {
        ApiError::SessionExpired(
            ErrorBody::detail_from(body).unwrap_or_else(|| SESSION_EXPIRED_MESSAGE.to_string()),
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Request { status, .. } => Some(*status),
            ApiError::SessionExpired(_) => Some(401),
            _ => None,
        }
    }

    /// Whether the user has to sign in again
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, ApiError::SessionExpired(_))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Encode(e.to_string())
    }
}
