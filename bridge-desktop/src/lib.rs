//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `SettingsStore` using a SQLite-backed key-value table
//! - `BlobStore` over a local directory with JSON metadata sidecars
//! - `LifecycleObserver` driven by window focus events
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{LocalBlobStore, SqliteSettingsStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let blobs = LocalBlobStore::new("/var/lib/pixpocket/blobs");
//!     let settings = SqliteSettingsStore::new("/var/lib/pixpocket/settings.db".into())
//!         .await
//!         .unwrap();
//!
//!     // Use in core configuration
//! }
//! ```

mod blob;
mod http;
mod lifecycle;
mod settings;

pub use blob::LocalBlobStore;
pub use http::ReqwestHttpClient;
pub use lifecycle::DesktopLifecycleObserver;
pub use settings::SqliteSettingsStore;
