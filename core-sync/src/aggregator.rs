//! # Listing Aggregator
//!
//! Finds the most recently uploaded photo of a user.
//!
//! ## Algorithm
//!
//! 1. List every object under `{prefix}/{owner}/` (one attempt, no retry)
//! 2. Fetch metadata for all of them, at most `max_concurrent_metadata_fetches`
//!    at a time, and wait for every fetch to finish
//! 3. Rank the fetches that produced a timestamp: newest first, ties broken
//!    by ascending object path
//! 4. Resolve the download URI of the best candidate, falling back down the
//!    ranking for at most `max_resolution_attempts` candidates
//!
//! A failed metadata fetch only removes that object from consideration.

use crate::error::{Result, SyncError};
use crate::photo::{PhotoRecord, UPLOAD_TIME_KEY};
use bridge_traits::{BlobStore, ObjectMetadata, OwnerId, RemoteRef};
use core_runtime::config::SyncTuning;
use core_runtime::logging::{mask_identifier, strip_path};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// An object whose metadata was fetched and carried a usable timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub remote_ref: RemoteRef,
    pub timestamp_millis: i64,
}

impl Candidate {
    /// `upload_time` custom metadata first, then the store's modification
    /// time. `None` when neither is usable.
    pub fn from_metadata(remote_ref: RemoteRef, metadata: &ObjectMetadata) -> Option<Self> {
        let timestamp_millis = metadata
            .custom_i64(UPLOAD_TIME_KEY)
            .or(metadata.updated_millis)?;
        Some(Self {
            remote_ref,
            timestamp_millis,
        })
    }
}

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationResult {
    /// Objects returned by the listing
    pub attempted: usize,
    /// Metadata fetches that produced a timestamp
    pub succeeded: usize,
    pub winner: Option<PhotoRecord>,
    /// Candidates whose download URI could not be resolved
    pub resolution_failures: usize,
}

impl AggregationResult {
    /// Whether this result may replace the cached photo.
    pub fn is_conclusive(&self) -> bool {
        self.decision().is_ok()
    }

    /// What the cache slot should hold after this pass.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NoReachableCandidates`] when objects were listed but
    ///   none of them returned usable metadata
    /// - [`SyncError::UnresolvedWinner`] when candidates exist but no
    ///   download URI could be resolved
    pub fn decision(&self) -> Result<Option<PhotoRecord>> {
        if self.attempted > 0 && self.succeeded == 0 {
            return Err(SyncError::NoReachableCandidates {
                attempted: self.attempted,
            });
        }
        if self.succeeded > 0 && self.winner.is_none() {
            return Err(SyncError::UnresolvedWinner {
                tried: self.resolution_failures,
            });
        }
        Ok(self.winner.clone())
    }
}

/// Order candidates newest first; equal timestamps by ascending path.
pub fn rank_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.timestamp_millis
            .cmp(&a.timestamp_millis)
            .then_with(|| a.remote_ref.cmp(&b.remote_ref))
    });
    candidates
}

pub struct ListingAggregator {
    store: Arc<dyn BlobStore>,
    tuning: SyncTuning,
}

impl ListingAggregator {
    pub fn new(store: Arc<dyn BlobStore>, tuning: SyncTuning) -> Self {
        Self { store, tuning }
    }

    /// Find the newest photo of `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::RemoteUnavailable`] if the listing fails. Per
    /// object failures are counted in the result instead.
    #[instrument(skip(self, owner), fields(owner = %mask_identifier(owner.as_str())))]
    pub async fn find_newest(&self, owner: &OwnerId) -> Result<AggregationResult> {
        let prefix = self.tuning.owner_prefix(owner.as_str());

        let refs = self.store.list(&prefix).await.map_err(|e| {
            warn!(error = %e, "Listing failed");
            SyncError::RemoteUnavailable(e.to_string())
        })?;

        if refs.is_empty() {
            debug!("No objects listed");
            return Ok(AggregationResult::default());
        }

        let attempted = refs.len();
        let candidates = self.fetch_candidates(refs).await;
        let succeeded = candidates.len();
        debug!(attempted, succeeded, "Metadata fan-out finished");

        let ranked = rank_candidates(candidates);
        let (winner, resolution_failures) = self.resolve_winner(owner, &ranked).await;

        info!(
            attempted,
            succeeded,
            resolution_failures,
            winner = winner.as_ref().map(|w| strip_path(w.remote_ref.as_str())),
            "Aggregation complete"
        );

        Ok(AggregationResult {
            attempted,
            succeeded,
            winner,
            resolution_failures,
        })
    }

    /// One metadata fetch per object, bounded, full join.
    async fn fetch_candidates(&self, refs: Vec<RemoteRef>) -> Vec<Candidate> {
        let limit = self.tuning.max_concurrent_metadata_fetches.max(1);

        stream::iter(refs)
            .map(|remote_ref| {
                let store = self.store.clone();
                async move {
                    match store.metadata(&remote_ref).await {
                        Ok(metadata) => {
                            let candidate = Candidate::from_metadata(remote_ref.clone(), &metadata);
                            if candidate.is_none() {
                                debug!(
                                    file = strip_path(remote_ref.as_str()),
                                    "Object has no usable timestamp"
                                );
                            }
                            candidate
                        }
                        Err(e) => {
                            warn!(
                                file = strip_path(remote_ref.as_str()),
                                error = %e,
                                "Metadata fetch failed"
                            );
                            None
                        }
                    }
                }
            })
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn resolve_winner(
        &self,
        owner: &OwnerId,
        ranked: &[Candidate],
    ) -> (Option<PhotoRecord>, usize) {
        let mut failures = 0;

        for candidate in ranked.iter().take(self.tuning.max_resolution_attempts) {
            match self.store.download_uri(&candidate.remote_ref).await {
                Ok(uri) => {
                    let record = PhotoRecord::new(
                        candidate.remote_ref.clone(),
                        owner.clone(),
                        candidate.timestamp_millis,
                        uri,
                    );
                    return (Some(record), failures);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        file = strip_path(candidate.remote_ref.as_str()),
                        error = %e,
                        "Download URI resolution failed, trying next candidate"
                    );
                }
            }
        }

        (None, failures)
    }
}
