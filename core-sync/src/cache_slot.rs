//! # Cache Slot
//!
//! Holds the single "most recent photo" for the signed-in user and persists
//! it across restarts.
//!
//! ## Concurrency
//!
//! - Writers serialize on an async mutex that stays held while the new value
//!   is persisted, so the durable copy and the published copy never diverge.
//! - Readers get an immutable [`SlotSnapshot`] from a `watch` channel and
//!   never wait on I/O.
//! - Every refresh run takes a [`RefreshTicket`] when it starts. A write
//!   carrying a ticket older than the last applied write (or issued for a
//!   different owner) is rejected as [`SlotWrite::Stale`]. `discard` and
//!   `wipe` consume a ticket of their own, so runs started before them can
//!   no longer write.
//!
//! ## Persistence
//!
//! One JSON document per owner under `cache_slot.{owner}`:
//!
//! ```json
//! { "current": { "id": "...", "remote_ref": "...", ... }, "last_refreshed_millis": 1700000000000 }
//! ```

use crate::error::{Result, SyncError};
use crate::photo::PhotoRecord;
use bridge_traits::{Clock, OwnerId, SettingsStore};
use core_runtime::logging::mask_identifier;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, instrument, warn};

const KEY_PREFIX: &str = "cache_slot.";

/// Immutable view of the slot handed to readers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub owner_id: Option<OwnerId>,
    pub current: Option<PhotoRecord>,
    /// When the slot was last written (Unix millis), 0 if never
    pub last_refreshed_millis: i64,
}

/// Start-order stamp of one refresh run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTicket {
    generation: u64,
    owner: OwnerId,
}

impl RefreshTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }
}

/// Result of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    /// The value was persisted and published. `changed` is false when the
    /// slot already held the same record.
    Applied { changed: bool },
    /// A newer write (or a discard) got there first; nothing was written.
    Stale,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSlot {
    current: Option<PhotoRecord>,
    last_refreshed_millis: i64,
}

struct WriterState {
    owner: Option<OwnerId>,
    current: Option<PhotoRecord>,
    applied_generation: u64,
}

pub struct CacheSlot {
    store: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    writer: Mutex<WriterState>,
    snapshot: watch::Sender<SlotSnapshot>,
    generations: AtomicU64,
}

impl CacheSlot {
    pub fn new(store: Arc<dyn SettingsStore>, clock: Arc<dyn Clock>) -> Self {
        let (snapshot, _) = watch::channel(SlotSnapshot::default());
        Self {
            store,
            clock,
            writer: Mutex::new(WriterState {
                owner: None,
                current: None,
                applied_generation: 0,
            }),
            snapshot,
            generations: AtomicU64::new(0),
        }
    }

    fn key(owner: &OwnerId) -> String {
        format!("{}{}", KEY_PREFIX, owner)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> SlotSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn current(&self) -> Option<PhotoRecord> {
        self.snapshot.borrow().current.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotSnapshot> {
        self.snapshot.subscribe()
    }

    // ------------------------------------------------------------------
    // Writers
    // ------------------------------------------------------------------

    /// Load the persisted slot for `owner` unless it is already bound.
    ///
    /// An unreadable document is treated as empty.
    #[instrument(skip(self, owner), fields(owner = %mask_identifier(owner.as_str())))]
    pub async fn bind(&self, owner: &OwnerId) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.owner.as_ref() == Some(owner) {
            return Ok(());
        }

        let persisted = match self
            .store
            .get_string(&Self::key(owner))
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?
        {
            Some(raw) => serde_json::from_str::<PersistedSlot>(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable cached photo");
                PersistedSlot::default()
            }),
            None => PersistedSlot::default(),
        };

        // Tickets issued before the switch must not land on the new owner
        writer.applied_generation = self.next_generation();
        writer.owner = Some(owner.clone());
        writer.current = persisted.current.clone();

        self.snapshot.send_replace(SlotSnapshot {
            owner_id: Some(owner.clone()),
            current: persisted.current,
            last_refreshed_millis: persisted.last_refreshed_millis,
        });
        debug!(has_photo = writer.current.is_some(), "Bound cache slot");
        Ok(())
    }

    /// Stamp a refresh run for `owner` with its start order.
    pub fn begin_refresh(&self, owner: &OwnerId) -> RefreshTicket {
        RefreshTicket {
            generation: self.next_generation(),
            owner: owner.clone(),
        }
    }

    /// Replace the slot content with the outcome of the run that took
    /// `ticket`.
    ///
    /// The new value is persisted before it is published; if persisting
    /// fails the slot is left untouched.
    #[instrument(skip(self, ticket, photo), fields(generation = ticket.generation))]
    pub async fn replace(
        &self,
        ticket: &RefreshTicket,
        photo: Option<PhotoRecord>,
    ) -> Result<SlotWrite> {
        let mut writer = self.writer.lock().await;

        if writer.owner.as_ref() != Some(&ticket.owner) {
            debug!("Rejecting write for an owner that is no longer bound");
            return Ok(SlotWrite::Stale);
        }
        if ticket.generation <= writer.applied_generation {
            debug!(
                applied = writer.applied_generation,
                "Rejecting write from a run superseded by a newer write"
            );
            return Ok(SlotWrite::Stale);
        }

        let changed = writer.current != photo;
        self.persist_locked(&mut writer, ticket.generation, photo)
            .await?;
        Ok(SlotWrite::Applied { changed })
    }

    /// Clear the current photo and invalidate every run already started.
    #[instrument(skip(self))]
    pub async fn discard(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let generation = self.next_generation();

        if writer.owner.is_none() {
            writer.applied_generation = generation;
            writer.current = None;
            self.snapshot.send_modify(|s| s.current = None);
            return Ok(());
        }

        self.persist_locked(&mut writer, generation, None).await
    }

    /// Forget everything about the bound owner, including the persisted
    /// copy. Used on sign-out.
    #[instrument(skip(self))]
    pub async fn wipe(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.applied_generation = self.next_generation();
        writer.current = None;
        let owner = writer.owner.take();
        self.snapshot.send_replace(SlotSnapshot::default());

        if let Some(owner) = owner {
            self.store
                .delete(&Self::key(&owner))
                .await
                .map_err(|e| SyncError::Persistence(e.to_string()))?;
            debug!("Wiped cached photo");
        }
        Ok(())
    }

    async fn persist_locked(
        &self,
        writer: &mut WriterState,
        generation: u64,
        photo: Option<PhotoRecord>,
    ) -> Result<()> {
        let Some(owner) = writer.owner.clone() else {
            return Ok(());
        };

        let now = self.clock.unix_timestamp_millis();
        let document = PersistedSlot {
            current: photo.clone(),
            last_refreshed_millis: now,
        };
        let raw = serde_json::to_string(&document)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        self.store
            .set_string(&Self::key(&owner), &raw)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        writer.applied_generation = generation;
        writer.current = photo.clone();
        self.snapshot.send_replace(SlotSnapshot {
            owner_id: Some(owner),
            current: photo,
            last_refreshed_millis: now,
        });
        Ok(())
    }
}

impl std::fmt::Debug for CacheSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSlot")
            .field("snapshot", &*self.snapshot.borrow())
            .finish()
    }
}
