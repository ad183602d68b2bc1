//! # Photo Sync Module
//!
//! Keeps the "most recent photo" of the signed-in user in step with the
//! remote object store.
//!
//! ## Overview
//!
//! - Uploading captures with an `upload_time` stamp and observable progress
//! - Listing the user's folder and picking the newest object, tolerating
//!   individual metadata failures
//! - Scheduling refreshes on resume, on pull-to-refresh and after uploads,
//!   coalescing overlapping requests
//! - Persisting the chosen photo so it survives restarts
//!
//! ## Components
//!
//! - **Upload Coordinator** (`upload`): Upload task state machine, progress, error classification
//! - **Listing Aggregator** (`aggregator`): Bounded metadata fan-out and deterministic winner selection
//! - **Sync Scheduler** (`scheduler`): Idle/Refreshing state machine with a single pending slot
//! - **Cache Slot** (`cache_slot`): Persisted single-writer slot with stale-write rejection
//! - **Refresh Pipeline** (`refresh`): One refresh run wired from identity to slot

pub mod aggregator;
pub mod cache_slot;
pub mod error;
pub mod photo;
pub mod refresh;
pub mod scheduler;
pub mod upload;

pub use aggregator::{rank_candidates, AggregationResult, Candidate, ListingAggregator};
pub use cache_slot::{CacheSlot, RefreshTicket, SlotSnapshot, SlotWrite};
pub use error::{Result, SyncError, UploadErrorKind};
pub use photo::{PhotoRecord, UPLOAD_TIME_KEY};
pub use refresh::RefreshPipeline;
pub use scheduler::{
    RefreshOutcome, RefreshRunner, RefreshTrigger, SchedulerPhase, SchedulerState, SyncScheduler,
};
pub use upload::{
    classify_upload_error, CaptureSource, UploadCoordinator, UploadFailure, UploadHandle,
    UploadId, UploadState, UploadTask,
};
