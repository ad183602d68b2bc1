use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why an upload failed, as far as the user needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    PermissionDenied,
    NetworkUnavailable,
    QuotaExceeded,
    Unknown,
}

impl UploadErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadErrorKind::PermissionDenied => "permission_denied",
            UploadErrorKind::NetworkUnavailable => "network_unavailable",
            UploadErrorKind::QuotaExceeded => "quota_exceeded",
            UploadErrorKind::Unknown => "unknown",
        }
    }

    /// Short message suitable for a toast.
    pub fn user_message(&self) -> &'static str {
        match self {
            UploadErrorKind::PermissionDenied => "Permission denied. Please check storage rules.",
            UploadErrorKind::NetworkUnavailable => "Network error. Please check your connection.",
            UploadErrorKind::QuotaExceeded => "Storage quota exceeded.",
            UploadErrorKind::Unknown => "Failed to save photo.",
        }
    }
}

impl fmt::Display for UploadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("No signed-in user")]
    Unauthenticated,

    #[error("Remote listing unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("None of the {attempted} listed objects returned usable metadata")]
    NoReachableCandidates { attempted: usize },

    #[error("Could not resolve a download URI for any of the newest {tried} candidates")]
    UnresolvedWinner { tried: usize },

    #[error("Upload failed ({kind}): {message}")]
    Upload {
        kind: UploadErrorKind,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
