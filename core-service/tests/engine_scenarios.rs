//! End-to-end behaviour of the photo engine against an in-memory store.

use async_trait::async_trait;
use bridge_desktop::{DesktopLifecycleObserver, SqliteSettingsStore};
use bridge_traits::{
    error::{BridgeError, Result as BridgeResult},
    BlobStore, LifecycleState, ManualClock, ObjectMetadata, ProgressReporter, SettingsStore,
};
use bytes::Bytes;
use core_runtime::events::{CoreEvent, SyncEvent};
use core_service::{
    CaptureSource, CoreError, EngineConfig, OwnerId, PhotoEngine, RemoteRef, StaticIdentity,
    SyncError, UploadErrorKind,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Fakes
// ============================================================================

struct StoredObject {
    path: String,
    custom: HashMap<String, String>,
    visible_at: Instant,
}

/// Bucket that makes new objects listable only after `listing_lag`.
#[derive(Default)]
struct FakeCloud {
    objects: Mutex<Vec<StoredObject>>,
    listing_lag: Duration,
    list_delay: Duration,
    metadata_delay: Duration,
    put_error: Mutex<Option<String>>,
    list_error: Mutex<Option<String>>,
    failing_metadata: Mutex<HashSet<String>>,
    puts: AtomicUsize,
    lists: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCloud {
    fn with_lag(listing_lag: Duration) -> Self {
        Self {
            listing_lag,
            ..Default::default()
        }
    }

    fn seed(&self, path: &str, upload_time: i64) {
        let mut custom = HashMap::new();
        custom.insert("upload_time".to_string(), upload_time.to_string());
        self.objects.lock().unwrap().push(StoredObject {
            path: path.to_string(),
            custom,
            visible_at: Instant::now(),
        });
    }

    fn fail_puts(&self, message: &str) {
        *self.put_error.lock().unwrap() = Some(message.to_string());
    }

    fn fail_listing(&self, message: Option<&str>) {
        *self.list_error.lock().unwrap() = message.map(str::to_string);
    }

    fn fail_metadata_for(&self, path: &str) {
        self.failing_metadata.lock().unwrap().insert(path.to_string());
    }
}

#[async_trait]
impl BlobStore for FakeCloud {
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
        progress: ProgressReporter,
    ) -> BridgeResult<RemoteRef> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.put_error.lock().unwrap().clone() {
            return Err(BridgeError::OperationFailed(message));
        }

        let total = data.len() as u64;
        for step in 1..=4u64 {
            progress.report_bytes(total * step / 4, total);
            tokio::task::yield_now().await;
        }

        self.objects.lock().unwrap().push(StoredObject {
            path: path.to_string(),
            custom: metadata,
            visible_at: Instant::now() + self.listing_lag,
        });
        Ok(RemoteRef::new(path))
    }

    async fn list(&self, prefix: &str) -> BridgeResult<Vec<RemoteRef>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        if let Some(message) = self.list_error.lock().unwrap().clone() {
            return Err(BridgeError::NetworkUnavailable(message));
        }

        let now = Instant::now();
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.path.starts_with(prefix) && o.visible_at <= now)
            .map(|o| RemoteRef::new(o.path.clone()))
            .collect())
    }

    async fn metadata(&self, object: &RemoteRef) -> BridgeResult<ObjectMetadata> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.metadata_delay.is_zero() {
            tokio::time::sleep(self.metadata_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_metadata.lock().unwrap().contains(object.as_str()) {
            return Err(BridgeError::NetworkUnavailable("connection reset".to_string()));
        }

        let objects = self.objects.lock().unwrap();
        let stored = objects
            .iter()
            .find(|o| o.path == object.as_str())
            .ok_or_else(|| BridgeError::NotFound(object.to_string()))?;
        Ok(ObjectMetadata {
            custom: stored.custom.clone(),
            ..Default::default()
        })
    }

    async fn download_uri(&self, object: &RemoteRef) -> BridgeResult<String> {
        Ok(format!("mem://{}", object))
    }
}

#[derive(Default)]
struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set_i64(&self, key: &str, value: i64) -> BridgeResult<()> {
        self.set_string(key, &value.to_string()).await
    }

    async fn get_i64(&self, key: &str) -> BridgeResult<Option<i64>> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.parse().ok()))
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> BridgeResult<Vec<String>> {
        Ok(self.values.lock().unwrap().keys().cloned().collect())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn alice() -> OwnerId {
    OwnerId::new("alice").unwrap()
}

fn config(
    cloud: Arc<FakeCloud>,
    identity: Arc<StaticIdentity>,
    settings: Arc<dyn SettingsStore>,
) -> core_service::Result<EngineConfig> {
    Ok(EngineConfig::builder()
        .blob_store(cloud)
        .identity_provider(identity)
        .settings_store(settings)
        .clock(Arc::new(ManualClock::new(1000)))
        .propagation_delay(Duration::from_secs(2))
        .build()?)
}

async fn engine_for(cloud: Arc<FakeCloud>) -> PhotoEngine {
    let identity = Arc::new(StaticIdentity::new(Some(alice())));
    let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
    PhotoEngine::new(config(cloud, identity, settings).unwrap())
        .await
        .unwrap()
}

fn temp_db() -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("pixpocket-engine-{}", uuid::Uuid::new_v4()))
        .join("settings.db")
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_newest_of_existing_uploads_wins() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/100_a.jpg", 100);
    cloud.seed("uploads/alice/300_c.jpg", 300);
    cloud.seed("uploads/alice/200_b.jpg", 200);
    cloud.seed("uploads/bob/900_z.jpg", 900);

    let engine = engine_for(cloud).await;
    let photo = engine.refresh_now().await.unwrap().unwrap();

    assert_eq!(photo.remote_ref.as_str(), "uploads/alice/300_c.jpg");
    assert_eq!(photo.upload_timestamp_millis, 300);
    assert_eq!(photo.download_uri, "mem://uploads/alice/300_c.jpg");
    assert_eq!(engine.current_photo(), Some(photo));
    engine.shutdown();
}

#[tokio::test]
async fn test_unreadable_metadata_does_not_block_refresh() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/100_a.jpg", 100);
    cloud.seed("uploads/alice/300_c.jpg", 300);
    cloud.seed("uploads/alice/200_b.jpg", 200);
    cloud.fail_metadata_for("uploads/alice/300_c.jpg");

    let engine = engine_for(cloud).await;
    let mut events = engine
        .events()
        .filter(|e| matches!(e, CoreEvent::Sync(SyncEvent::RefreshCompleted { .. })));

    let photo = engine.refresh_now().await.unwrap().unwrap();
    assert_eq!(photo.upload_timestamp_millis, 200);

    match events.recv().await.unwrap() {
        CoreEvent::Sync(SyncEvent::RefreshCompleted {
            attempted,
            succeeded,
            ..
        }) => {
            assert_eq!(attempted, 3);
            assert_eq!(succeeded, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
    engine.shutdown();
}

#[tokio::test]
async fn test_empty_folder_yields_no_photo() {
    let cloud = Arc::new(FakeCloud::default());
    let engine = engine_for(cloud.clone()).await;

    assert_eq!(engine.refresh_now().await.unwrap(), None);
    assert_eq!(cloud.lists.load(Ordering::SeqCst), 1);
    engine.shutdown();
}

#[tokio::test]
async fn test_failed_refresh_keeps_cached_photo() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/100_a.jpg", 100);
    let engine = engine_for(cloud.clone()).await;
    let before = engine.refresh_now().await.unwrap();

    cloud.fail_listing(Some("offline"));
    let err = engine.refresh_now().await.unwrap_err();

    assert!(matches!(
        err.as_sync(),
        Some(SyncError::RemoteUnavailable(_))
    ));
    assert_eq!(engine.current_photo(), before);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_delayed_refresh_finds_lagging_upload() {
    let cloud = Arc::new(FakeCloud::with_lag(Duration::from_millis(500)));
    cloud.seed("uploads/alice/100_a.jpg", 100);
    let engine = engine_for(cloud.clone()).await;

    let mut completed = engine
        .events()
        .filter(|e| matches!(e, CoreEvent::Sync(SyncEvent::RefreshCompleted { .. })));

    let handle = engine
        .submit_capture(CaptureSource::from_bytes(vec![1u8; 4096], "image/jpeg"))
        .unwrap();
    let uploaded = handle.wait().await.unwrap();
    assert_eq!(uploaded.upload_timestamp_millis, 1000);
    assert!(uploaded.remote_ref.as_str().starts_with("uploads/alice/1000_"));
    assert!(uploaded.remote_ref.as_str().ends_with(".jpg"));

    // The immediate refresh cannot see the new object yet
    match completed.recv().await.unwrap() {
        CoreEvent::Sync(SyncEvent::RefreshCompleted {
            trigger, winner, ..
        }) => {
            assert_eq!(trigger, "post_upload");
            assert_eq!(winner.as_deref(), Some("uploads/alice/100_a.jpg"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    match completed.recv().await.unwrap() {
        CoreEvent::Sync(SyncEvent::RefreshCompleted {
            trigger, winner, ..
        }) => {
            assert_eq!(trigger, "propagation_retry");
            assert_eq!(winner.as_deref(), Some(uploaded.remote_ref.as_str()));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(engine.current_photo(), Some(uploaded));
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_quota_failure_is_classified_and_skips_refresh() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.fail_puts("Quota exceeded for bucket");
    let engine = engine_for(cloud.clone()).await;

    let handle = engine
        .submit_capture(CaptureSource::from_bytes(vec![0u8; 16], "image/png"))
        .unwrap();
    let failure = handle.wait().await.unwrap_err();

    assert_eq!(failure.kind, UploadErrorKind::QuotaExceeded);
    assert!(failure.remote_ref.is_none());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.scheduler().state().completed_runs, 0);
    assert_eq!(cloud.lists.load(Ordering::SeqCst), 0);
    engine.shutdown();
}

#[tokio::test]
async fn test_upload_without_identity_touches_nothing() {
    let cloud = Arc::new(FakeCloud::default());
    let identity = Arc::new(StaticIdentity::new(None));
    let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
    let engine = PhotoEngine::new(config(cloud.clone(), identity, settings).unwrap())
        .await
        .unwrap();

    let err = engine
        .submit_capture(CaptureSource::from_bytes(vec![0u8; 16], "image/jpeg"))
        .unwrap_err();

    assert!(matches!(err, CoreError::Sync(SyncError::Unauthenticated)));
    assert_eq!(cloud.puts.load(Ordering::SeqCst), 0);

    let err = engine.refresh_now().await.unwrap_err();
    assert!(matches!(err, CoreError::Sync(SyncError::Unauthenticated)));
    assert_eq!(cloud.lists.load(Ordering::SeqCst), 0);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_progress_never_goes_backwards() {
    let cloud = Arc::new(FakeCloud::default());
    let engine = engine_for(cloud).await;

    let handle = engine
        .submit_capture(CaptureSource::from_bytes(vec![9u8; 1 << 16], "image/jpeg"))
        .unwrap();
    let mut progress = handle.progress();
    let collector = tokio::spawn(async move {
        let mut seen = vec![*progress.borrow_and_update()];
        while progress.changed().await.is_ok() {
            let value = *progress.borrow_and_update();
            seen.push(value);
            if value >= 1.0 {
                break;
            }
        }
        seen
    });

    handle.wait().await.unwrap();
    let seen = collector.await.unwrap();

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(seen.last().copied(), Some(1.0));
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_metadata_fan_out_respects_bound() {
    let cloud = Arc::new(FakeCloud {
        metadata_delay: Duration::from_millis(10),
        ..Default::default()
    });
    for ts in 0..40 {
        cloud.seed(&format!("uploads/alice/{}_x.jpg", ts), ts);
    }

    let identity = Arc::new(StaticIdentity::new(Some(alice())));
    let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
    let config = EngineConfig::builder()
        .blob_store(cloud.clone())
        .identity_provider(identity)
        .settings_store(settings)
        .max_concurrent_metadata_fetches(4)
        .build()
        .unwrap();
    let engine = PhotoEngine::new(config).await.unwrap();

    let photo = engine.refresh_now().await.unwrap().unwrap();

    assert_eq!(photo.upload_timestamp_millis, 39);
    let peak = cloud.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak concurrency {}", peak);
    assert!(peak > 1, "fetches ran sequentially");
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_wipes_slot_and_cancels_delayed_refresh() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/100_a.jpg", 100);
    let identity = Arc::new(StaticIdentity::new(Some(alice())));
    let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
    let engine = PhotoEngine::new(config(cloud.clone(), identity.clone(), settings.clone()).unwrap())
        .await
        .unwrap();

    let handle = engine
        .submit_capture(CaptureSource::from_bytes(vec![1u8; 32], "image/jpeg"))
        .unwrap();
    handle.wait().await.unwrap();

    let mut scheduler = engine.scheduler().subscribe();
    scheduler
        .wait_for(|s| s.completed_runs >= 1 && s.current.is_none())
        .await
        .unwrap();
    assert!(engine.current_photo().is_some());

    identity.set(None);
    engine.sign_out().await.unwrap();
    assert_eq!(engine.current_photo(), None);
    assert!(settings.list_keys().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(engine.scheduler().state().completed_runs, 1);
    assert_eq!(engine.current_photo(), None);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_drops_queued_refresh() {
    let cloud = Arc::new(FakeCloud {
        list_delay: Duration::from_secs(1),
        ..Default::default()
    });
    cloud.seed("uploads/alice/100_a.jpg", 100);
    let identity = Arc::new(StaticIdentity::new(Some(alice())));
    let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
    let engine = PhotoEngine::new(config(cloud.clone(), identity, settings.clone()).unwrap())
        .await
        .unwrap();

    engine.refresh();
    // Let the first run reach the listing call
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.refresh();
    assert!(engine.scheduler().state().pending.is_some());

    // Identity still reports the old user here
    engine.sign_out().await.unwrap();
    assert!(engine.scheduler().state().pending.is_none());

    let state = engine.scheduler().wait_idle().await;
    assert_eq!(state.completed_runs, 1);
    assert_eq!(cloud.lists.load(Ordering::SeqCst), 1);
    assert_eq!(engine.current_photo(), None);
    assert!(settings.list_keys().await.unwrap().is_empty());
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ui_thread_outside_runtime_drives_engine() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/100_a.jpg", 100);
    let engine = engine_for(cloud.clone()).await;

    let handle = std::thread::scope(|ui| {
        ui.spawn(|| {
            engine.refresh();
            engine.on_resume();
            engine.submit_capture(CaptureSource::from_bytes(vec![3u8; 128], "image/jpeg"))
        })
        .join()
        .unwrap()
    })
    .unwrap();

    let uploaded = handle.wait().await.unwrap();
    let mut slot = engine.subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        slot.wait_for(|s| s.current.as_ref() == Some(&uploaded)),
    )
    .await
    .expect("uploaded photo never became current")
    .unwrap();

    assert_eq!(cloud.puts.load(Ordering::SeqCst), 1);
    engine.shutdown();
}

#[tokio::test]
async fn test_discard_clears_until_next_refresh() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/100_a.jpg", 100);
    let engine = engine_for(cloud).await;

    engine.refresh_now().await.unwrap();
    engine.discard().await.unwrap();
    assert_eq!(engine.current_photo(), None);

    let photo = engine.refresh_now().await.unwrap();
    assert_eq!(photo.map(|p| p.upload_timestamp_millis), Some(100));
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_photo_survives_restart_until_sign_out() {
    let db = temp_db();
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/300_c.jpg", 300);
    let identity = Arc::new(StaticIdentity::new(Some(alice())));

    let settings: Arc<dyn SettingsStore> =
        Arc::new(SqliteSettingsStore::new(db.clone()).await.unwrap());
    let engine = PhotoEngine::new(config(cloud.clone(), identity.clone(), settings).unwrap())
        .await
        .unwrap();
    let photo = engine.refresh_now().await.unwrap();
    engine.shutdown();
    drop(engine);

    // Restarted offline: the cached photo is available without a refresh
    cloud.fail_listing(Some("offline"));
    let settings: Arc<dyn SettingsStore> =
        Arc::new(SqliteSettingsStore::new(db.clone()).await.unwrap());
    let engine = PhotoEngine::new(config(cloud.clone(), identity.clone(), settings).unwrap())
        .await
        .unwrap();
    assert_eq!(engine.current_photo(), photo);

    engine.sign_out().await.unwrap();
    engine.shutdown();
    drop(engine);

    let settings: Arc<dyn SettingsStore> =
        Arc::new(SqliteSettingsStore::new(db.clone()).await.unwrap());
    let engine = PhotoEngine::new(config(cloud, identity, settings).unwrap())
        .await
        .unwrap();
    assert_eq!(engine.current_photo(), None);
    engine.shutdown();

    if let Some(dir) = db.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[tokio::test]
async fn test_foreground_transition_triggers_refresh() {
    let cloud = Arc::new(FakeCloud::default());
    cloud.seed("uploads/alice/100_a.jpg", 100);
    let engine = engine_for(cloud).await;

    let observer = Arc::new(DesktopLifecycleObserver::new());
    engine.watch_lifecycle(observer.clone()).await.unwrap();
    let mut slot = engine.subscribe();

    observer.set_state(LifecycleState::Background);
    observer.set_state(LifecycleState::Foreground);

    tokio::time::timeout(
        Duration::from_secs(5),
        slot.wait_for(|s| s.current.is_some()),
    )
    .await
    .expect("no refresh after resume")
    .unwrap();

    assert_eq!(
        engine.scheduler().state().last_outcome.map(|(t, _)| t.as_str()),
        Some("app_resume")
    );
    engine.shutdown();
}

#[tokio::test]
async fn test_requests_after_shutdown_are_refused() {
    let engine = engine_for(Arc::new(FakeCloud::default())).await;
    engine.shutdown();

    assert!(matches!(
        engine.refresh_now().await,
        Err(CoreError::ShutDown)
    ));
}
