//! # Event Bus System
//!
//! Broadcasts typed engine events to any number of host subscribers using
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: one enum per domain (auth, upload, sync, photo), wrapped
//!   by [`CoreEvent`]
//! - **EventBus**: the broadcast channel every engine component emits into
//! - **EventStream**: a receiver with optional filtering
//!
//! ```text
//! ┌──────────────────┐  emit   ┌───────────┐  subscribe  ┌────────────┐
//! │ UploadCoordinator├────────>│           ├────────────>│ UI layer   │
//! └──────────────────┘         │ EventBus  │             └────────────┘
//! ┌──────────────────┐  emit   │           │  subscribe  ┌────────────┐
//! │ RefreshPipeline  ├────────>│           ├────────────>│ Telemetry  │
//! └──────────────────┘         └───────────┘             └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, PhotoEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Photo(PhotoEvent::Cleared)).ok();
//! assert_eq!(stream.recv().await.unwrap(), CoreEvent::Photo(PhotoEvent::Cleared));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber fell `n` events behind; it can
//!   keep receiving.
//! - **`RecvError::Closed`**: the engine was dropped.
//!
//! Emitting with no subscribers returns an error which emitters ignore; the
//! engine never depends on anybody listening.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Auth(AuthEvent),
    Upload(UploadEvent),
    Sync(SyncEvent),
    Photo(PhotoEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Auth(e) => e.description(),
            CoreEvent::Upload(e) => e.description(),
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Photo(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Upload(UploadEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::RefreshFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::StaleResultDiscarded { .. }) => EventSeverity::Debug,
            CoreEvent::Upload(UploadEvent::Progress { .. }) => EventSeverity::Debug,
            CoreEvent::Sync(SyncEvent::RefreshStarted { .. }) => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Authentication Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// Local state for the signed-out user was wiped.
    SignedOut,
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::SignedOut => "User signed out",
        }
    }
}

// ============================================================================
// Upload Events
// ============================================================================

/// Lifecycle of a single capture upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum UploadEvent {
    Started {
        upload_id: String,
        /// Destination object path
        remote_path: String,
    },
    Progress {
        upload_id: String,
        /// Whole percent, 0..=100
        percent: u8,
    },
    Completed {
        upload_id: String,
        remote_ref: String,
    },
    Failed {
        upload_id: String,
        /// Classified kind, e.g. `permission_denied`
        kind: String,
        message: String,
    },
}

impl UploadEvent {
    fn description(&self) -> &str {
        match self {
            UploadEvent::Started { .. } => "Upload started",
            UploadEvent::Progress { .. } => "Upload progress",
            UploadEvent::Completed { .. } => "Upload completed",
            UploadEvent::Failed { .. } => "Upload failed",
        }
    }

    pub fn upload_id(&self) -> &str {
        match self {
            UploadEvent::Started { upload_id, .. }
            | UploadEvent::Progress { upload_id, .. }
            | UploadEvent::Completed { upload_id, .. }
            | UploadEvent::Failed { upload_id, .. } => upload_id,
        }
    }
}

// ============================================================================
// Sync Events
// ============================================================================

/// Refresh runs against the remote listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    RefreshStarted {
        /// What caused the run (`app_resume`, `pull_to_refresh`, ...)
        trigger: String,
    },
    RefreshCompleted {
        trigger: String,
        /// Objects found by the listing
        attempted: usize,
        /// Metadata fetches that succeeded
        succeeded: usize,
        /// Winning object path, if any
        winner: Option<String>,
    },
    RefreshFailed {
        trigger: String,
        message: String,
    },
    /// A run finished after a newer run (or a discard) had already written.
    StaleResultDiscarded {
        trigger: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::RefreshStarted { .. } => "Refresh started",
            SyncEvent::RefreshCompleted { .. } => "Refresh completed",
            SyncEvent::RefreshFailed { .. } => "Refresh failed",
            SyncEvent::StaleResultDiscarded { .. } => "Stale refresh result discarded",
        }
    }
}

// ============================================================================
// Photo Events
// ============================================================================

/// Changes to the cached "most recent photo".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PhotoEvent {
    Changed {
        remote_ref: String,
        download_uri: String,
        upload_timestamp_millis: i64,
    },
    Cleared,
}

impl PhotoEvent {
    fn description(&self) -> &str {
        match self {
            PhotoEvent::Changed { .. } => "Most recent photo changed",
            PhotoEvent::Cleared => "Most recent photo cleared",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for engine events.
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error when nobody is subscribed.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus};
///
/// let bus = EventBus::new(16);
/// let uploads_only = bus.subscribe().filter(|e| matches!(e, CoreEvent::Upload(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Returns `None` if no matching event is currently buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
