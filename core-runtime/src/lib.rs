//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the PixPocket sync core:
//! - Logging and tracing infrastructure
//! - Engine configuration and bridge validation
//! - Event bus system
//!
//! ## Overview
//!
//! Every other core crate depends on this one for its logging conventions,
//! its typed events, and the [`EngineConfig`](config::EngineConfig) that
//! carries injected bridges and tuning knobs.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
