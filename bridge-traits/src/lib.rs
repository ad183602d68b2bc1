//! # Host Bridge Traits
//!
//! Contracts between the PixPocket sync core and the host platform.
//!
//! ## Overview
//!
//! The core owns the synchronization logic: uploading captures, finding the
//! newest photo in a user's remote folder, and caching it. Everything that
//! touches the outside world is injected through the traits in this crate.
//!
//! ## Traits
//!
//! ### Remote Storage
//! - [`BlobStore`](blob::BlobStore) - Per-user cloud object store (put, list, metadata, download URI)
//! - [`HttpClient`](http::HttpClient) - Raw HTTP for REST-backed stores
//!
//! ### Identity & Persistence
//! - [`IdentityProvider`](identity::IdentityProvider) - Who is signed in
//! - [`SettingsStore`](storage::SettingsStore) - Durable key-value preferences
//!
//! ### Platform Integration
//! - [`LifecycleObserver`](background::LifecycleObserver) - App foreground/background transitions
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](logging::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`, `provider-firebase` | ✅ In Progress |
//! | Android  | Kotlin adapters over the Firebase SDK | 📋 Planned |
//! | iOS      | Swift adapters over the Firebase SDK  | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Adapters should
//! report permission, connectivity and quota problems through the matching
//! structured variants; the core falls back to inspecting the message text
//! only when an adapter reports `OperationFailed`.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`; the core calls them from many
//! tasks at once.

pub mod background;
pub mod blob;
pub mod error;
pub mod http;
pub mod identity;
pub mod logging;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use background::{LifecycleChangeStream, LifecycleObserver, LifecycleState};
pub use blob::{BlobStore, ObjectMetadata, ProgressReporter, RemoteRef};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use identity::{IdentityProvider, OwnerId, StaticIdentity};
pub use logging::{ConsoleLogger, LogEntry, LogLevel, LoggerSink};
pub use storage::SettingsStore;
pub use time::{Clock, ManualClock, SystemClock};
