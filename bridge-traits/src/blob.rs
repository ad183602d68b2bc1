//! Remote Object Storage Abstraction
//!
//! Provides the contract for a per-user cloud object store (Firebase Storage,
//! S3-compatible buckets, or a local directory for desktop testing).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;

/// Opaque reference to an object in the remote store.
///
/// The wrapped value is the full object path (e.g.
/// `uploads/abc123/1700000000000_4f1c.jpg`). References order
/// lexicographically by path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRef(String);

impl RemoteRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata reported by the store for a single object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Custom key/value metadata written at upload time
    pub custom: HashMap<String, String>,
    /// Server-side last modification time (Unix millis)
    pub updated_millis: Option<i64>,
    /// Object size in bytes
    pub size: Option<u64>,
    /// MIME type recorded by the store
    pub content_type: Option<String>,
}

impl ObjectMetadata {
    /// Parse a custom metadata value as an integer.
    pub fn custom_i64(&self, key: &str) -> Option<i64> {
        self.custom.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }
}

/// Upload progress publisher handed to [`BlobStore::put`].
///
/// Values are clamped to `[0.0, 1.0]` and only ever increase, so observers
/// see a monotonic fraction regardless of how the adapter reports bytes.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<f64>>,
}

impl ProgressReporter {
    /// Create a reporter together with a receiver observing it.
    pub fn channel() -> (Self, watch::Receiver<f64>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Reporter whose updates nobody observes.
    pub fn detached() -> Self {
        Self::channel().0
    }

    /// Publish a completed fraction.
    pub fn report(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    /// Publish progress as transferred/total bytes.
    pub fn report_bytes(&self, transferred: u64, total: u64) {
        if total == 0 {
            return;
        }
        self.report(transferred as f64 / total as f64);
    }

    pub fn current(&self) -> f64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.tx.subscribe()
    }
}

/// Remote object store trait
///
/// Abstracts the per-user cloud bucket that holds captured photos:
/// - **Android/iOS**: Firebase Storage SDK
/// - **Desktop**: Firebase Storage REST API or a local directory
///
/// Implementations must be safe for concurrent use; the core issues
/// metadata fetches for many objects at once.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::blob::{BlobStore, ProgressReporter};
///
/// async fn newest_listing(store: &dyn BlobStore) -> Result<usize> {
///     let refs = store.list("uploads/abc123/").await?;
///     Ok(refs.len())
/// }
/// ```
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` at `path` with custom metadata.
    ///
    /// The metadata must be attached atomically with the object; no reader
    /// may observe the object without it. Progress is reported through
    /// `progress` as bytes are transferred.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
        progress: ProgressReporter,
    ) -> Result<RemoteRef>;

    /// List every object directly under `prefix`. Order is unspecified.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteRef>>;

    /// Fetch metadata for a single object.
    async fn metadata(&self, object: &RemoteRef) -> Result<ObjectMetadata>;

    /// Resolve a URI a renderer can load the object from.
    async fn download_uri(&self, object: &RemoteRef) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_ref_ordering() {
        let a = RemoteRef::new("uploads/u/100_a.jpg");
        let b = RemoteRef::new("uploads/u/100_b.jpg");

        assert!(a < b);
        assert_eq!(a.file_name(), "100_a.jpg");
    }

    #[test]
    fn test_custom_metadata_parse() {
        let meta = ObjectMetadata::default()
            .with_custom("upload_time", "1700000000000")
            .with_custom("note", "not-a-number");

        assert_eq!(meta.custom_i64("upload_time"), Some(1_700_000_000_000));
        assert_eq!(meta.custom_i64("note"), None);
        assert_eq!(meta.custom_i64("missing"), None);
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let (reporter, rx) = ProgressReporter::channel();

        reporter.report(0.4);
        reporter.report(0.2);
        assert_eq!(*rx.borrow(), 0.4);

        reporter.report(7.0);
        assert_eq!(*rx.borrow(), 1.0);

        reporter.report(f64::NAN);
        assert_eq!(reporter.current(), 1.0);
    }

    #[test]
    fn test_progress_from_bytes() {
        let (reporter, rx) = ProgressReporter::channel();

        reporter.report_bytes(0, 0);
        assert_eq!(*rx.borrow(), 0.0);

        reporter.report_bytes(512, 1024);
        assert_eq!(*rx.borrow(), 0.5);
    }
}
