//! The cached "most recent photo" record.

use bridge_traits::{OwnerId, RemoteRef};
use serde::{Deserialize, Serialize};

/// Custom metadata key holding the capture time (Unix millis, decimal).
pub const UPLOAD_TIME_KEY: &str = "upload_time";

/// A photo that exists remotely and can be rendered.
///
/// Identity is the `remote_ref`; two records with the same reference
/// describe the same object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Object file name without extension
    pub id: String,
    pub remote_ref: RemoteRef,
    pub owner_id: OwnerId,
    /// Capture time written at upload, or the store's modification time
    /// for objects uploaded without it
    pub upload_timestamp_millis: i64,
    pub download_uri: String,
}

impl PhotoRecord {
    pub fn new(
        remote_ref: RemoteRef,
        owner_id: OwnerId,
        upload_timestamp_millis: i64,
        download_uri: impl Into<String>,
    ) -> Self {
        let file_name = remote_ref.file_name();
        let id = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(file_name)
            .to_string();

        Self {
            id,
            remote_ref,
            owner_id,
            upload_timestamp_millis,
            download_uri: download_uri.into(),
        }
    }

    pub fn same_object(&self, other: &PhotoRecord) -> bool {
        self.remote_ref == other.remote_ref
    }
}
