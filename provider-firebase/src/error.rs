//! Error types for the Firebase Storage provider

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Firebase Storage provider errors
#[derive(Error, Debug)]
pub enum FirebaseError {
    /// API request returned a non-success status
    #[error("Firebase Storage API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Object exists but has no download token
    #[error("Object has no download token: {0}")]
    MissingDownloadToken(String),

    /// Bridge error
    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for Firebase Storage operations
pub type Result<T> = std::result::Result<T, FirebaseError>;

impl FirebaseError {
    /// Whether a read request failing this way is worth repeating.
    pub fn is_transient(&self) -> bool {
        match self {
            FirebaseError::ApiError { status_code, message } => {
                *status_code >= 500 || (*status_code == 429 && !mentions_quota(message))
            }
            FirebaseError::BridgeError(BridgeError::NetworkUnavailable(_)) => true,
            _ => false,
        }
    }
}

fn mentions_quota(message: &str) -> bool {
    message.to_lowercase().contains("quota")
}

impl From<FirebaseError> for BridgeError {
    fn from(error: FirebaseError) -> Self {
        match error {
            FirebaseError::ApiError {
                status_code,
                message,
            } => match status_code {
                401 | 403 => BridgeError::PermissionDenied(message),
                402 | 507 => BridgeError::QuotaExceeded(message),
                429 if mentions_quota(&message) => BridgeError::QuotaExceeded(message),
                404 => BridgeError::NotFound(message),
                _ => BridgeError::OperationFailed(format!(
                    "API error (status {}): {}",
                    status_code, message
                )),
            },
            FirebaseError::ParseError(msg) => {
                BridgeError::OperationFailed(format!("Parse error: {}", msg))
            }
            FirebaseError::MissingDownloadToken(name) => {
                BridgeError::NotFound(format!("No download token for {}", name))
            }
            FirebaseError::BridgeError(e) => e,
        }
    }
}
