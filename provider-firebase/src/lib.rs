//! # Firebase Storage Provider
//!
//! Implements `BlobStore` over the Firebase Storage REST API for hosts that
//! have no native Firebase SDK (desktop, CLI tools, tests against the
//! emulator).
//!
//! ## Overview
//!
//! This module provides:
//! - Folder listing with page-token pagination
//! - Object metadata including custom `upload_time`
//! - Multipart uploads carrying metadata and media in one request
//! - Download URIs built from the object's download token
//! - Mapping of HTTP statuses to structured bridge errors

mod connector;
pub mod error;
pub mod types;

pub use connector::{FirebaseStorageConnector, FIREBASE_STORAGE_BASE};
pub use error::{FirebaseError, Result};
