//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (blob store,
//! identity, settings, clock, lifecycle) into the sync core and exposes the
//! [`PhotoEngine`]. Desktop apps typically enable the `desktop-shims`
//! feature (which depends on `bridge-desktop`) and the `firebase` feature
//! for the REST-backed store.
//!
//! ```ignore
//! use core_service::{EngineConfig, PhotoEngine, CaptureSource};
//!
//! let config = EngineConfig::builder()
//!     .blob_store(blob_store)
//!     .identity_provider(identity)
//!     .data_dir("/var/lib/pixpocket")
//!     .build()?;
//! let engine = PhotoEngine::new(config).await?;
//!
//! engine.on_resume();
//! let upload = engine.submit_capture(CaptureSource::from_file("capture.jpg"))?;
//! let photo = upload.wait().await?;
//! ```

mod engine;
pub mod error;

pub use engine::PhotoEngine;
pub use error::{CoreError, Result};

pub use bridge_traits::{OwnerId, RemoteRef, StaticIdentity};
pub use core_runtime::config::{EngineConfig, EngineConfigBuilder, SyncTuning};
pub use core_runtime::events::{CoreEvent, EventStream};
pub use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
pub use core_sync::{
    CaptureSource, PhotoRecord, SlotSnapshot, SyncError, UploadErrorKind, UploadFailure,
    UploadHandle, UploadState,
};

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

#[cfg(feature = "firebase")]
pub use provider_firebase;
