//! # Upload Coordinator
//!
//! Ships one captured (or picked) image to the remote store.
//!
//! ## Workflow
//!
//! 1. Stamp the capture time from the injected clock
//! 2. Build the object path `{prefix}/{owner}/{millis}_{upload-id}.{ext}`
//! 3. Read the source into memory
//! 4. `put` with `upload_time` custom metadata, forwarding progress
//! 5. Resolve the download URI and produce a [`PhotoRecord`]
//!
//! The caller gets an [`UploadHandle`] back immediately; the work runs on
//! its own task. Failed uploads are classified and reported, never retried.

use crate::error::{SyncError, UploadErrorKind};
use crate::photo::{PhotoRecord, UPLOAD_TIME_KEY};
use bridge_traits::error::BridgeError;
use bridge_traits::{BlobStore, Clock, OwnerId, ProgressReporter, RemoteRef};
use bytes::Bytes;
use core_runtime::config::SyncTuning;
use core_runtime::events::{CoreEvent, EventBus, UploadEvent};
use core_runtime::logging::{mask_identifier, strip_path};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Upload State Machine
// ============================================================================

/// Why an upload ended without a usable photo.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct UploadFailure {
    pub kind: UploadErrorKind,
    pub message: String,
    /// Set when the object was stored but its download URI could not be
    /// resolved.
    pub remote_ref: Option<RemoteRef>,
}

impl UploadFailure {
    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remote_ref: None,
        }
    }

    fn from_bridge(error: &BridgeError) -> Self {
        Self::new(classify_upload_error(error), error.to_string())
    }
}

impl From<UploadFailure> for SyncError {
    fn from(failure: UploadFailure) -> Self {
        SyncError::Upload {
            kind: failure.kind,
            message: failure.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    InFlight,
    Succeeded(PhotoRecord),
    Failed(UploadFailure),
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::InFlight => "in_flight",
            UploadState::Succeeded(_) => "succeeded",
            UploadState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Succeeded(_) | UploadState::Failed(_))
    }

    /// True once the object exists remotely, even if resolving its URI
    /// failed afterwards.
    pub fn object_stored(&self) -> bool {
        match self {
            UploadState::Succeeded(_) => true,
            UploadState::Failed(failure) => failure.remote_ref.is_some(),
            _ => false,
        }
    }
}

/// One upload and where it stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub id: UploadId,
    pub owner_id: OwnerId,
    pub remote_path: String,
    pub created_at_millis: i64,
    pub state: UploadState,
}

impl UploadTask {
    pub fn new(owner_id: OwnerId, remote_path: String, created_at_millis: i64) -> Self {
        Self::with_id(UploadId::new(), owner_id, remote_path, created_at_millis)
    }

    fn with_id(
        id: UploadId,
        owner_id: OwnerId,
        remote_path: String,
        created_at_millis: i64,
    ) -> Self {
        Self {
            id,
            owner_id,
            remote_path,
            created_at_millis,
            state: UploadState::Pending,
        }
    }

    /// Mark the transfer as started
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not `Pending`
    pub fn start(mut self) -> Result<Self, SyncError> {
        self.validate_transition(&UploadState::InFlight)?;
        self.state = UploadState::InFlight;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an error if the task is not `InFlight`
    pub fn succeed(mut self, record: PhotoRecord) -> Result<Self, SyncError> {
        let next = UploadState::Succeeded(record);
        self.validate_transition(&next)?;
        self.state = next;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an error if the task already reached a terminal state
    pub fn fail(mut self, failure: UploadFailure) -> Result<Self, SyncError> {
        let next = UploadState::Failed(failure);
        self.validate_transition(&next)?;
        self.state = next;
        Ok(self)
    }

    fn validate_transition(&self, to: &UploadState) -> Result<(), SyncError> {
        let valid = match (&self.state, to) {
            (UploadState::Pending, UploadState::InFlight) => true,
            // Local read failures end the task before the transfer starts
            (UploadState::Pending, UploadState::Failed(_)) => true,

            (UploadState::InFlight, UploadState::Succeeded(_)) => true,
            (UploadState::InFlight, UploadState::Failed(_)) => true,

            _ => false,
        };

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition upload from {} to {}",
                    self.state.as_str(),
                    to.as_str()
                ),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Error Classification
// ============================================================================

/// Map a store error to the kind shown to the user.
///
/// Structured variants win; anything else is classified by scanning the
/// message for "permission", then "network", then "quota".
pub fn classify_upload_error(error: &BridgeError) -> UploadErrorKind {
    match error {
        BridgeError::PermissionDenied(_) => return UploadErrorKind::PermissionDenied,
        BridgeError::NetworkUnavailable(_) => return UploadErrorKind::NetworkUnavailable,
        BridgeError::QuotaExceeded(_) => return UploadErrorKind::QuotaExceeded,
        BridgeError::Io(io) => match io.kind() {
            std::io::ErrorKind::PermissionDenied => return UploadErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::TimedOut => return UploadErrorKind::NetworkUnavailable,
            _ => {}
        },
        _ => {}
    }

    classify_message(&error.to_string())
}

fn classify_message(message: &str) -> UploadErrorKind {
    let message = message.to_lowercase();
    if message.contains("permission") {
        UploadErrorKind::PermissionDenied
    } else if message.contains("network") {
        UploadErrorKind::NetworkUnavailable
    } else if message.contains("quota") {
        UploadErrorKind::QuotaExceeded
    } else {
        UploadErrorKind::Unknown
    }
}

// ============================================================================
// Capture Source
// ============================================================================

enum SourceBody {
    Bytes(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    File(PathBuf),
}

/// A finite image byte source: a fresh capture or a gallery pick.
pub struct CaptureSource {
    content_type: String,
    body: SourceBody,
}

impl CaptureSource {
    pub fn from_bytes(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            body: SourceBody::Bytes(data.into()),
        }
    }

    pub fn from_reader<R>(reader: R, content_type: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            content_type: content_type.into(),
            body: SourceBody::Reader(Box::new(reader)),
        }
    }

    /// Content type is guessed from the file extension.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            content_type: content_type_for_path(&path).to_string(),
            body: SourceBody::File(path),
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// File extension (with the dot) for the object name, empty when the
    /// content type is not a known image type.
    pub fn extension(&self) -> &'static str {
        match self.content_type.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => ".jpg",
            "image/png" => ".png",
            "image/webp" => ".webp",
            "image/heic" => ".heic",
            _ => "",
        }
    }

    async fn read_all(self) -> std::io::Result<Bytes> {
        match self.body {
            SourceBody::Bytes(bytes) => Ok(bytes),
            SourceBody::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            SourceBody::File(path) => tokio::fs::read(&path).await.map(Bytes::from),
        }
    }
}

impl fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            SourceBody::Bytes(b) => format!("bytes({})", b.len()),
            SourceBody::Reader(_) => "reader".to_string(),
            SourceBody::File(p) => format!("file({})", p.display()),
        };
        f.debug_struct("CaptureSource")
            .field("content_type", &self.content_type)
            .field("body", &body)
            .finish()
    }
}

fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// Upload Handle
// ============================================================================

/// Caller's view of a running upload.
#[derive(Debug)]
pub struct UploadHandle {
    id: UploadId,
    remote_path: String,
    progress: watch::Receiver<f64>,
    state: watch::Receiver<UploadState>,
    join: JoinHandle<Result<PhotoRecord, UploadFailure>>,
}

impl UploadHandle {
    pub fn id(&self) -> UploadId {
        self.id
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Monotonic fraction in `[0, 1]`.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    pub fn state(&self) -> watch::Receiver<UploadState> {
        self.state.clone()
    }

    /// Wait for the upload to finish.
    pub async fn wait(self) -> Result<PhotoRecord, UploadFailure> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(UploadFailure::new(
                UploadErrorKind::Unknown,
                format!("upload task aborted: {}", e),
            )),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct UploadCoordinator {
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    tuning: SyncTuning,
    runtime: Handle,
}

impl UploadCoordinator {
    /// Upload jobs run on `runtime`; callers need not be inside it.
    pub fn new(
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        tuning: SyncTuning,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            tuning,
            runtime,
        }
    }

    /// Start uploading `source` for `owner`.
    #[instrument(skip(self, source, owner), fields(owner = %mask_identifier(owner.as_str())))]
    pub fn upload(&self, source: CaptureSource, owner: OwnerId) -> UploadHandle {
        let created_at = self.clock.unix_timestamp_millis();
        let id = UploadId::new();
        let remote_path = format!(
            "{}{}_{}{}",
            self.tuning.owner_prefix(owner.as_str()),
            created_at,
            id,
            source.extension()
        );

        let task = UploadTask::with_id(id, owner, remote_path.clone(), created_at);
        let (state_tx, state_rx) = watch::channel(UploadState::Pending);
        let (reporter, progress_rx) = ProgressReporter::channel();

        info!(upload_id = %id, file = strip_path(&remote_path), "Upload queued");

        let job = UploadJob {
            store: self.store.clone(),
            events: self.events.clone(),
            state_tx,
        };
        let span = tracing::info_span!("upload", upload_id = %id);
        let join = self
            .runtime
            .spawn(job.run(task, source, reporter).instrument(span));

        UploadHandle {
            id,
            remote_path,
            progress: progress_rx,
            state: state_rx,
            join,
        }
    }
}

struct UploadJob {
    store: Arc<dyn BlobStore>,
    events: EventBus,
    state_tx: watch::Sender<UploadState>,
}

impl UploadJob {
    async fn run(
        self,
        task: UploadTask,
        source: CaptureSource,
        reporter: ProgressReporter,
    ) -> Result<PhotoRecord, UploadFailure> {
        let upload_id = task.id.as_str();
        self.emit(UploadEvent::Started {
            upload_id: upload_id.clone(),
            remote_path: task.remote_path.clone(),
        });

        let data = match source.read_all().await {
            Ok(data) => data,
            Err(e) => {
                let failure = UploadFailure::from_bridge(&BridgeError::Io(e));
                return self.finish_failed(task, failure);
            }
        };

        let task = match task.start() {
            Ok(task) => task,
            Err(e) => return Err(UploadFailure::new(UploadErrorKind::Unknown, e.to_string())),
        };
        self.state_tx.send_replace(task.state.clone());
        debug!(bytes = data.len(), "Transferring capture");

        let forwarder = spawn_progress_forwarder(
            reporter.subscribe(),
            self.events.clone(),
            upload_id.clone(),
        );

        let mut metadata = HashMap::new();
        metadata.insert(
            UPLOAD_TIME_KEY.to_string(),
            task.created_at_millis.to_string(),
        );

        let put_result = self
            .store
            .put(&task.remote_path, data, metadata, reporter.clone())
            .await;

        let remote_ref = match put_result {
            Ok(remote_ref) => remote_ref,
            Err(e) => {
                drop(reporter);
                let _ = forwarder.await;
                return self.finish_failed(task, UploadFailure::from_bridge(&e));
            }
        };

        let uri = match self.store.download_uri(&remote_ref).await {
            Ok(uri) => uri,
            Err(e) => {
                drop(reporter);
                let _ = forwarder.await;
                let mut failure = UploadFailure::from_bridge(&e);
                failure.remote_ref = Some(remote_ref);
                return self.finish_failed(task, failure);
            }
        };

        reporter.report(1.0);
        drop(reporter);
        let _ = forwarder.await;

        let record = PhotoRecord::new(
            remote_ref.clone(),
            task.owner_id.clone(),
            task.created_at_millis,
            uri,
        );

        match task.succeed(record.clone()) {
            Ok(task) => {
                self.state_tx.send_replace(task.state);
            }
            Err(e) => return Err(UploadFailure::new(UploadErrorKind::Unknown, e.to_string())),
        }

        info!(file = strip_path(remote_ref.as_str()), "Upload completed");
        self.emit(UploadEvent::Completed {
            upload_id,
            remote_ref: remote_ref.to_string(),
        });
        Ok(record)
    }

    fn finish_failed(
        &self,
        task: UploadTask,
        failure: UploadFailure,
    ) -> Result<PhotoRecord, UploadFailure> {
        warn!(
            kind = %failure.kind,
            error = %failure.message,
            stored = failure.remote_ref.is_some(),
            "Upload failed"
        );

        let upload_id = task.id.as_str();
        if let Ok(task) = task.fail(failure.clone()) {
            self.state_tx.send_replace(task.state);
        }

        self.emit(UploadEvent::Failed {
            upload_id,
            kind: failure.kind.as_str().to_string(),
            message: failure.message.clone(),
        });
        Err(failure)
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events.emit(CoreEvent::Upload(event));
    }
}

/// Turn fractional progress into whole-percent events until the reporter is
/// dropped.
fn spawn_progress_forwarder(
    mut rx: watch::Receiver<f64>,
    events: EventBus,
    upload_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_percent: Option<u8> = None;
        loop {
            let percent = (*rx.borrow_and_update() * 100.0).floor().clamp(0.0, 100.0) as u8;
            if last_percent.map_or(percent > 0, |last| percent > last) {
                last_percent = Some(percent);
                let _ = events.emit(CoreEvent::Upload(UploadEvent::Progress {
                    upload_id: upload_id.clone(),
                    percent,
                }));
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}
