//! # Sync Scheduler
//!
//! Decides when refreshes run and makes sure overlapping requests collapse.
//!
//! ## States
//!
//! ```text
//!            request()                       run finished, nothing pending
//!   Idle ─────────────────▶ Refreshing ──────────────────────────────────▶ Idle
//!                             │    ▲
//!                   request() │    │ run finished, pending trigger taken
//!                  (pending)  ▼    │
//!                           Refreshing
//! ```
//!
//! While a run is in flight, further requests only record a single pending
//! trigger (the latest wins). When the run ends, a pending trigger causes
//! exactly one more run. Runs are never interrupted.
//!
//! After an upload, [`SyncScheduler::post_upload`] requests a refresh at
//! once and schedules one more after the propagation delay, since the store
//! may not list a fresh object immediately.

use crate::error::SyncError;
use async_trait::async_trait;
use bridge_traits::RemoteRef;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTrigger {
    AppResume,
    PullToRefresh,
    PostUpload,
    /// Second post-upload refresh after the propagation delay
    PropagationRetry,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTrigger::AppResume => "app_resume",
            RefreshTrigger::PullToRefresh => "pull_to_refresh",
            RefreshTrigger::PostUpload => "post_upload",
            RefreshTrigger::PropagationRetry => "propagation_retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The slot was written with the run's result.
    Updated {
        winner: Option<RemoteRef>,
        changed: bool,
    },
    /// A newer write got there first; the result was dropped.
    Stale,
    /// Nobody is signed in.
    Skipped,
    Failed(SyncError),
}

/// Performs one refresh.
#[async_trait]
pub trait RefreshRunner: Send + Sync {
    async fn run(&self, trigger: RefreshTrigger) -> RefreshOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Refreshing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerState {
    pub phase: SchedulerPhase,
    /// Trigger of the run in flight
    pub current: Option<RefreshTrigger>,
    /// At most one follow-up run
    pub pending: Option<RefreshTrigger>,
    pub completed_runs: u64,
    pub last_outcome: Option<(RefreshTrigger, RefreshOutcome)>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            phase: SchedulerPhase::Idle,
            current: None,
            pending: None,
            completed_runs: 0,
            last_outcome: None,
        }
    }
}

struct Inner {
    runner: Arc<dyn RefreshRunner>,
    state: watch::Sender<SchedulerState>,
    propagation_delay: Duration,
    delayed: Mutex<CancellationToken>,
    closed: AtomicBool,
    runtime: Handle,
}

/// Cloning is cheap; clones drive the same state.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    /// Runs are spawned on `runtime`, so requests may come from threads
    /// outside it.
    pub fn new(
        runner: Arc<dyn RefreshRunner>,
        propagation_delay: Duration,
        runtime: Handle,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::default());
        Self {
            inner: Arc::new(Inner {
                runner,
                state,
                propagation_delay,
                delayed: Mutex::new(CancellationToken::new()),
                closed: AtomicBool::new(false),
                runtime,
            }),
        }
    }

    /// Ask for a refresh. Returns `false` once the scheduler is shut down.
    #[instrument(skip(self), fields(trigger = trigger.as_str()))]
    pub fn request(&self, trigger: RefreshTrigger) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("Scheduler shut down, ignoring refresh request");
            return false;
        }

        let mut start = false;
        self.inner.state.send_modify(|state| match state.phase {
            SchedulerPhase::Idle => {
                state.phase = SchedulerPhase::Refreshing;
                state.current = Some(trigger);
                start = true;
            }
            SchedulerPhase::Refreshing => {
                state.pending = Some(trigger);
            }
        });

        if start {
            let inner = self.inner.clone();
            let span = tracing::info_span!("refresh_loop");
            self.inner
                .runtime
                .spawn(async move { inner.drive(trigger).await }.instrument(span));
        } else {
            debug!("Refresh in flight, coalesced into pending run");
        }
        true
    }

    /// Refresh now and once more after the propagation delay.
    pub fn post_upload(&self) {
        if !self.request(RefreshTrigger::PostUpload) {
            return;
        }

        let token = self.lock_delayed().child_token();
        let scheduler = self.clone();
        let delay = self.inner.propagation_delay;

        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Delayed post-upload refresh cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    scheduler.request(RefreshTrigger::PropagationRetry);
                }
            }
        });
    }

    /// Cancel every delayed refresh scheduled so far. Later
    /// [`post_upload`](Self::post_upload) calls schedule normally.
    pub fn cancel_delayed(&self) {
        let mut guard = self.lock_delayed();
        guard.cancel();
        *guard = CancellationToken::new();
    }

    /// Forget the coalesced follow-up run, if any. The run in flight still
    /// finishes.
    pub fn clear_pending(&self) {
        self.inner.state.send_if_modified(|state| state.pending.take().is_some());
    }

    /// Stop accepting requests and drop delayed refreshes. A run in flight
    /// finishes on its own.
    pub fn shutdown(&self) {
        info!("Shutting down sync scheduler");
        self.inner.closed.store(true, Ordering::SeqCst);
        self.lock_delayed().cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    /// Wait until no run is in flight or pending.
    pub async fn wait_idle(&self) -> SchedulerState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|s| s.phase == SchedulerPhase::Idle).await {
            Ok(state) => state.clone(),
            // The sender lives in `self`, so this only happens mid-drop
            Err(_) => self.state(),
        };
        state
    }

    fn lock_delayed(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.inner
            .delayed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    async fn drive(&self, first: RefreshTrigger) {
        let mut trigger = first;

        loop {
            debug!(trigger = trigger.as_str(), "Starting refresh run");
            let outcome = AssertUnwindSafe(self.runner.run(trigger))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(trigger = trigger.as_str(), "Refresh run panicked");
                    RefreshOutcome::Failed(SyncError::Internal("refresh run panicked".to_string()))
                });

            let mut next = None;
            self.state.send_modify(|state| {
                state.completed_runs += 1;
                state.last_outcome = Some((trigger, outcome));
                match state.pending.take() {
                    Some(pending) => {
                        state.current = Some(pending);
                        next = Some(pending);
                    }
                    None => {
                        state.phase = SchedulerPhase::Idle;
                        state.current = None;
                    }
                }
            });

            match next {
                Some(pending) => trigger = pending,
                None => break,
            }
        }
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("state", &*self.inner.state.borrow())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records triggers; blocks every run until released.
    struct GatedRunner {
        runs: Mutex<Vec<RefreshTrigger>>,
        release: watch::Sender<bool>,
    }

    impl GatedRunner {
        fn new(open: bool) -> Arc<Self> {
            let (release, _) = watch::channel(open);
            Arc::new(Self {
                runs: Mutex::new(Vec::new()),
                release,
            })
        }

        fn open(&self) {
            self.release.send_replace(true);
        }

        fn runs(&self) -> Vec<RefreshTrigger> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RefreshRunner for GatedRunner {
        async fn run(&self, trigger: RefreshTrigger) -> RefreshOutcome {
            let mut rx = self.release.subscribe();
            let _ = rx.wait_for(|open| *open).await;
            self.runs.lock().unwrap().push(trigger);
            RefreshOutcome::Updated {
                winner: None,
                changed: false,
            }
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl RefreshRunner for PanickingRunner {
        async fn run(&self, _trigger: RefreshTrigger) -> RefreshOutcome {
            panic!("boom");
        }
    }

    fn scheduler_for(runner: Arc<dyn RefreshRunner>, delay_ms: u64) -> SyncScheduler {
        SyncScheduler::new(runner, Duration::from_millis(delay_ms), Handle::current())
    }

    async fn wait_runs(scheduler: &SyncScheduler, n: u64) {
        let mut rx = scheduler.subscribe();
        rx.wait_for(|s| s.completed_runs >= n && s.phase == SchedulerPhase::Idle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_request_runs_once() {
        let runner = GatedRunner::new(true);
        let scheduler = scheduler_for(runner.clone(), 10);

        assert!(scheduler.request(RefreshTrigger::AppResume));
        let state = scheduler.wait_idle().await;

        assert_eq!(runner.runs(), vec![RefreshTrigger::AppResume]);
        assert_eq!(state.completed_runs, 1);
        assert!(matches!(
            state.last_outcome,
            Some((RefreshTrigger::AppResume, RefreshOutcome::Updated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_requests_coalesce_into_one_extra_run() {
        let runner = GatedRunner::new(false);
        let scheduler = scheduler_for(runner.clone(), 10);

        scheduler.request(RefreshTrigger::AppResume);
        assert_eq!(scheduler.state().phase, SchedulerPhase::Refreshing);

        for _ in 0..5 {
            scheduler.request(RefreshTrigger::PullToRefresh);
        }
        scheduler.request(RefreshTrigger::PostUpload);
        assert_eq!(scheduler.state().pending, Some(RefreshTrigger::PostUpload));

        runner.open();
        let state = scheduler.wait_idle().await;

        assert_eq!(
            runner.runs(),
            vec![RefreshTrigger::AppResume, RefreshTrigger::PostUpload]
        );
        assert_eq!(state.completed_runs, 2);
        assert!(state.pending.is_none());
    }

    #[tokio::test]
    async fn test_clear_pending_drops_follow_up_run() {
        let runner = GatedRunner::new(false);
        let scheduler = scheduler_for(runner.clone(), 10);

        scheduler.request(RefreshTrigger::AppResume);
        scheduler.request(RefreshTrigger::PullToRefresh);
        scheduler.clear_pending();
        assert!(scheduler.state().pending.is_none());

        runner.open();
        let state = scheduler.wait_idle().await;

        assert_eq!(runner.runs(), vec![RefreshTrigger::AppResume]);
        assert_eq!(state.completed_runs, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requests_from_thread_outside_runtime() {
        let runner = GatedRunner::new(true);
        let scheduler = scheduler_for(runner.clone(), 10);

        let from_ui = scheduler.clone();
        let accepted = std::thread::spawn(move || {
            from_ui.post_upload();
            from_ui.request(RefreshTrigger::PullToRefresh)
        })
        .join()
        .unwrap();
        assert!(accepted);

        wait_runs(&scheduler, 1).await;
        assert_eq!(runner.runs()[0], RefreshTrigger::PostUpload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_upload_schedules_delayed_retry() {
        let runner = GatedRunner::new(true);
        let scheduler = scheduler_for(runner.clone(), 1000);

        scheduler.post_upload();
        wait_runs(&scheduler, 1).await;
        assert_eq!(runner.runs(), vec![RefreshTrigger::PostUpload]);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        wait_runs(&scheduler, 2).await;
        assert_eq!(
            runner.runs(),
            vec![RefreshTrigger::PostUpload, RefreshTrigger::PropagationRetry]
        );

        // Exactly one delayed retry per upload
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.state().completed_runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_delayed_drops_pending_retry() {
        let runner = GatedRunner::new(true);
        let scheduler = scheduler_for(runner.clone(), 1000);

        scheduler.post_upload();
        wait_runs(&scheduler, 1).await;
        scheduler.cancel_delayed();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runner.runs(), vec![RefreshTrigger::PostUpload]);

        // New uploads schedule again
        scheduler.post_upload();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        wait_runs(&scheduler, 3).await;
        assert_eq!(runner.runs().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let runner = GatedRunner::new(true);
        let scheduler = scheduler_for(runner.clone(), 10);

        scheduler.shutdown();
        assert!(!scheduler.request(RefreshTrigger::PullToRefresh));
        scheduler.post_upload();

        let state = scheduler.wait_idle().await;
        assert_eq!(state.completed_runs, 0);
        assert!(runner.runs().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_runner_returns_to_idle() {
        let scheduler = scheduler_for(Arc::new(PanickingRunner), 10);

        scheduler.request(RefreshTrigger::AppResume);
        let state = scheduler.wait_idle().await;

        assert_eq!(state.phase, SchedulerPhase::Idle);
        assert!(matches!(
            state.last_outcome,
            Some((_, RefreshOutcome::Failed(SyncError::Internal(_))))
        ));

        // Still usable afterwards
        assert!(scheduler.request(RefreshTrigger::AppResume));
    }
}
