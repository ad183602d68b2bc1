//! Refresh pipeline: one scheduled run from identity lookup to slot write.

use crate::aggregator::ListingAggregator;
use crate::cache_slot::{CacheSlot, SlotWrite};
use crate::error::SyncError;
use crate::scheduler::{RefreshOutcome, RefreshRunner, RefreshTrigger};
use async_trait::async_trait;
use bridge_traits::IdentityProvider;
use core_runtime::events::{CoreEvent, EventBus, PhotoEvent, SyncEvent};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct RefreshPipeline {
    identity: Arc<dyn IdentityProvider>,
    slot: Arc<CacheSlot>,
    aggregator: ListingAggregator,
    events: EventBus,
}

impl RefreshPipeline {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        slot: Arc<CacheSlot>,
        aggregator: ListingAggregator,
        events: EventBus,
    ) -> Self {
        Self {
            identity,
            slot,
            aggregator,
            events,
        }
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.emit(event);
    }

    fn fail(&self, trigger: RefreshTrigger, error: SyncError) -> RefreshOutcome {
        warn!(error = %error, "Refresh failed, keeping cached photo");
        self.emit(CoreEvent::Sync(SyncEvent::RefreshFailed {
            trigger: trigger.as_str().to_string(),
            message: error.to_string(),
        }));
        RefreshOutcome::Failed(error)
    }
}

#[async_trait]
impl RefreshRunner for RefreshPipeline {
    #[instrument(skip(self), fields(trigger = trigger.as_str()))]
    async fn run(&self, trigger: RefreshTrigger) -> RefreshOutcome {
        let Some(owner) = self.identity.current_identity() else {
            debug!("No signed-in user, skipping refresh");
            return RefreshOutcome::Skipped;
        };

        if let Err(e) = self.slot.bind(&owner).await {
            return self.fail(trigger, e);
        }
        let ticket = self.slot.begin_refresh(&owner);

        self.emit(CoreEvent::Sync(SyncEvent::RefreshStarted {
            trigger: trigger.as_str().to_string(),
        }));

        let result = match self.aggregator.find_newest(&owner).await {
            Ok(result) => result,
            Err(e) => return self.fail(trigger, e),
        };

        let winner = match result.decision() {
            Ok(winner) => winner,
            Err(e) => return self.fail(trigger, e),
        };

        let write = match self.slot.replace(&ticket, winner.clone()).await {
            Ok(write) => write,
            Err(e) => return self.fail(trigger, e),
        };

        match write {
            SlotWrite::Stale => {
                info!(generation = ticket.generation(), "Discarding stale refresh result");
                self.emit(CoreEvent::Sync(SyncEvent::StaleResultDiscarded {
                    trigger: trigger.as_str().to_string(),
                }));
                RefreshOutcome::Stale
            }
            SlotWrite::Applied { changed } => {
                self.emit(CoreEvent::Sync(SyncEvent::RefreshCompleted {
                    trigger: trigger.as_str().to_string(),
                    attempted: result.attempted,
                    succeeded: result.succeeded,
                    winner: winner.as_ref().map(|w| w.remote_ref.to_string()),
                }));

                if changed {
                    let event = match &winner {
                        Some(photo) => PhotoEvent::Changed {
                            remote_ref: photo.remote_ref.to_string(),
                            download_uri: photo.download_uri.clone(),
                            upload_timestamp_millis: photo.upload_timestamp_millis,
                        },
                        None => PhotoEvent::Cleared,
                    };
                    self.emit(CoreEvent::Photo(event));
                }

                RefreshOutcome::Updated {
                    winner: winner.map(|w| w.remote_ref),
                    changed,
                }
            }
        }
    }
}
