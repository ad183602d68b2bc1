//! Photo engine: the object host applications talk to.

use crate::error::{CoreError, Result};
use bridge_traits::{IdentityProvider, LifecycleObserver, LifecycleState};
use core_runtime::config::EngineConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus, EventStream, PhotoEvent};
use core_runtime::logging::mask_identifier;
use core_sync::{
    CacheSlot, CaptureSource, ListingAggregator, PhotoRecord, RefreshOutcome, RefreshPipeline,
    RefreshTrigger, SlotSnapshot, SyncError, SyncScheduler, UploadCoordinator, UploadHandle,
};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Composition root of the sync core.
///
/// Owns the cache slot, the scheduler and the upload coordinator, and wires
/// them to the injected bridges. Background work runs on the runtime the
/// engine was built in; the synchronous methods may be called from any
/// thread, including a UI thread outside that runtime. None of them blocks
/// on network I/O except the explicitly awaited
/// [`refresh_now`](Self::refresh_now).
pub struct PhotoEngine {
    identity: Arc<dyn IdentityProvider>,
    slot: Arc<CacheSlot>,
    uploads: UploadCoordinator,
    scheduler: SyncScheduler,
    events: EventBus,
    runtime: Handle,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl PhotoEngine {
    /// Build the engine from a validated configuration.
    ///
    /// If someone is already signed in, their persisted photo is loaded so
    /// [`current_photo`](Self::current_photo) answers immediately.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tuning = config.tuning.clone();
        let runtime = Handle::current();

        let events = EventBus::new(tuning.event_buffer_size);
        let slot = Arc::new(CacheSlot::new(
            config.settings_store.clone(),
            config.clock.clone(),
        ));

        if let Some(owner) = config.identity_provider.current_identity() {
            slot.bind(&owner).await?;
            debug!(owner = %mask_identifier(owner.as_str()), "Restored cached photo");
        }

        let aggregator = ListingAggregator::new(config.blob_store.clone(), tuning.clone());
        let pipeline = Arc::new(RefreshPipeline::new(
            config.identity_provider.clone(),
            slot.clone(),
            aggregator,
            events.clone(),
        ));
        let scheduler = SyncScheduler::new(pipeline, tuning.propagation_delay, runtime.clone());
        let uploads = UploadCoordinator::new(
            config.blob_store.clone(),
            config.clock.clone(),
            events.clone(),
            tuning,
            runtime.clone(),
        );

        let engine = Self {
            identity: config.identity_provider.clone(),
            slot,
            uploads,
            scheduler,
            events,
            runtime,
            lifecycle_task: Mutex::new(None),
        };

        if let Some(observer) = config.lifecycle_observer {
            engine.watch_lifecycle(observer).await?;
        }

        info!("Photo engine ready");
        Ok(engine)
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    /// Upload a capture for the signed-in user.
    ///
    /// Once the object is stored, a refresh runs at once and again after the
    /// propagation delay.
    ///
    /// # Errors
    ///
    /// [`SyncError::Unauthenticated`] when nobody is signed in; nothing is
    /// sent to the store in that case.
    #[instrument(skip(self, source))]
    pub fn submit_capture(&self, source: CaptureSource) -> Result<UploadHandle> {
        let owner = self
            .identity
            .current_identity()
            .ok_or(SyncError::Unauthenticated)?;

        let handle = self.uploads.upload(source, owner);

        let mut state = handle.state();
        let scheduler = self.scheduler.clone();
        self.runtime.spawn(async move {
            let stored = match state.wait_for(|s| s.is_terminal()).await {
                Ok(state) => state.object_stored(),
                Err(_) => false,
            };
            if stored {
                scheduler.post_upload();
            }
        });

        Ok(handle)
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Fire-and-forget refresh; coalesced with any refresh already running.
    pub fn refresh(&self) {
        self.scheduler.request(RefreshTrigger::PullToRefresh);
    }

    /// The app came back to the foreground.
    pub fn on_resume(&self) {
        self.scheduler.request(RefreshTrigger::AppResume);
    }

    /// Refresh and wait for the result.
    ///
    /// # Errors
    ///
    /// The error of the last run, if it failed. The cached photo is left
    /// as it was in that case.
    pub async fn refresh_now(&self) -> Result<Option<PhotoRecord>> {
        if !self.scheduler.request(RefreshTrigger::PullToRefresh) {
            return Err(CoreError::ShutDown);
        }

        let state = self.scheduler.wait_idle().await;
        match state.last_outcome {
            Some((_, RefreshOutcome::Failed(e))) => Err(e.into()),
            Some((_, RefreshOutcome::Skipped)) => Err(SyncError::Unauthenticated.into()),
            _ => Ok(self.slot.current()),
        }
    }

    /// Turn every foreground transition reported by `observer` into a
    /// refresh. Replaces any observer watched before.
    pub async fn watch_lifecycle(&self, observer: Arc<dyn LifecycleObserver>) -> Result<()> {
        let mut changes = observer.subscribe_changes().await?;
        let scheduler = self.scheduler.clone();

        let task = self.runtime.spawn(async move {
            while let Some(state) = changes.next().await {
                debug!(?state, "Lifecycle transition");
                if state == LifecycleState::Foreground {
                    scheduler.request(RefreshTrigger::AppResume);
                }
            }
        });

        let previous = self
            .lifecycle_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    // ========================================================================
    // Slot access
    // ========================================================================

    pub fn current_photo(&self) -> Option<PhotoRecord> {
        self.slot.current()
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        self.slot.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotSnapshot> {
        self.slot.subscribe()
    }

    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Clear the current photo. Refreshes already running cannot bring it
    /// back; the next refresh can.
    pub async fn discard(&self) -> Result<()> {
        self.slot.discard().await?;
        let _ = self.events.emit(CoreEvent::Photo(PhotoEvent::Cleared));
        Ok(())
    }

    /// Forget the signed-out user's photo and drop queued and delayed
    /// refreshes. Runs in flight finish and are discarded as stale.
    ///
    /// Clear the [`IdentityProvider`] before calling this; a refresh
    /// requested while the old identity is still reported binds it again.
    pub async fn sign_out(&self) -> Result<()> {
        self.scheduler.cancel_delayed();
        self.scheduler.clear_pending();
        self.slot.wipe().await?;
        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::SignedOut));
        info!("Local photo state wiped on sign-out");
        Ok(())
    }

    /// Stop scheduling work. Uploads and runs already started finish.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Some(task) = self
            .lifecycle_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }
}

impl Drop for PhotoEngine {
    fn drop(&mut self) {
        if !self.scheduler.is_shut_down() {
            warn!("Photo engine dropped without shutdown");
            self.shutdown();
        }
    }
}
