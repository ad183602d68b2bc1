//! # Engine Configuration Module
//!
//! Builder-based configuration for the PixPocket sync engine.
//!
//! ## Overview
//!
//! [`EngineConfig`] holds every injected bridge plus the tuning knobs of the
//! synchronization core. The builder validates fail-fast: a missing required
//! bridge is reported with the capability name and how each platform is
//! expected to satisfy it.
//!
//! ## Required Dependencies
//!
//! - `BlobStore` - Remote object storage (Firebase Storage, local directory)
//! - `IdentityProvider` - Who is signed in
//! - `SettingsStore` - Durable storage for the cached photo
//!
//! ## Optional Dependencies
//!
//! - `Clock` - Defaults to [`SystemClock`]
//! - `LifecycleObserver` - Foreground transitions trigger a refresh
//!
//! When the `desktop-shims` feature is enabled and a `data_dir` is set, a
//! SQLite-backed `SettingsStore` is created under `data_dir/settings.db` if
//! none was injected.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::EngineConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = EngineConfig::builder()
//!     .blob_store(Arc::new(connector))
//!     .identity_provider(Arc::new(identity))
//!     .settings_store(Arc::new(settings))
//!     .max_concurrent_metadata_fetches(4)
//!     .propagation_delay(Duration::from_millis(1500))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{
    BlobStore, Clock, IdentityProvider, LifecycleObserver, SettingsStore, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::events::DEFAULT_EVENT_BUFFER_SIZE;

/// Default upper bound on concurrent metadata requests during a refresh.
pub const DEFAULT_MAX_CONCURRENT_METADATA_FETCHES: usize = 8;

/// Default delay before the follow-up refresh after an upload.
pub const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_millis(1000);

/// Default number of candidates tried when resolving a download URI.
pub const DEFAULT_MAX_RESOLUTION_ATTEMPTS: usize = 3;

/// Default root prefix under which per-user folders live.
pub const DEFAULT_UPLOAD_PREFIX: &str = "uploads";

/// Tuning knobs of the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTuning {
    /// Upper bound on in-flight metadata fetches within one refresh.
    pub max_concurrent_metadata_fetches: usize,

    /// Delay before the second refresh scheduled after an upload, covering
    /// listing propagation lag in the remote store.
    pub propagation_delay: Duration,

    /// How many candidates (newest first) are tried when resolving the
    /// winner's download URI.
    pub max_resolution_attempts: usize,

    /// Root prefix; objects live at `{upload_prefix}/{owner}/...`.
    pub upload_prefix: String,

    /// Per-subscriber event buffer.
    pub event_buffer_size: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            max_concurrent_metadata_fetches: DEFAULT_MAX_CONCURRENT_METADATA_FETCHES,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
            max_resolution_attempts: DEFAULT_MAX_RESOLUTION_ATTEMPTS,
            upload_prefix: DEFAULT_UPLOAD_PREFIX.to_string(),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl SyncTuning {
    /// Validates the tuning values.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_metadata_fetches == 0 {
            return Err(Error::Config(
                "max_concurrent_metadata_fetches must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_metadata_fetches > 256 {
            return Err(Error::Config(
                "max_concurrent_metadata_fetches exceeds maximum of 256".to_string(),
            ));
        }

        if self.propagation_delay > Duration::from_secs(30) {
            return Err(Error::Config(
                "propagation_delay exceeds maximum of 30 seconds".to_string(),
            ));
        }

        if self.max_resolution_attempts == 0 {
            return Err(Error::Config(
                "max_resolution_attempts must be at least 1".to_string(),
            ));
        }

        let prefix = self.upload_prefix.trim_matches('/');
        if prefix.is_empty() {
            return Err(Error::Config("upload_prefix cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "event_buffer_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Folder holding every object of `owner`, with a trailing slash.
    pub fn owner_prefix(&self, owner: &str) -> String {
        format!("{}/{}/", self.upload_prefix.trim_matches('/'), owner)
    }
}

/// Engine configuration.
///
/// Use [`EngineConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct EngineConfig {
    /// Directory for engine-owned files (desktop default settings store)
    pub data_dir: Option<PathBuf>,

    pub blob_store: Arc<dyn BlobStore>,

    pub identity_provider: Arc<dyn IdentityProvider>,

    pub settings_store: Arc<dyn SettingsStore>,

    pub clock: Arc<dyn Clock>,

    pub lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,

    pub tuning: SyncTuning,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("data_dir", &self.data_dir)
            .field("blob_store", &"BlobStore { ... }")
            .field("identity_provider", &"IdentityProvider { ... }")
            .field("settings_store", &"SettingsStore { ... }")
            .field("clock", &"Clock { ... }")
            .field(
                "lifecycle_observer",
                &self
                    .lifecycle_observer
                    .as_ref()
                    .map(|_| "LifecycleObserver { ... }"),
            )
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            if dir.as_os_str().is_empty() {
                return Err(Error::Config("Data directory cannot be empty".to_string()));
            }
        }
        self.tuning.validate()
    }
}

fn blob_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "BlobStore".to_string(),
        message: "BlobStore implementation is required for uploading and listing photos. \
                 Desktop: construct a FirebaseStorageConnector (provider-firebase) or a LocalBlobStore (bridge-desktop). \
                 Mobile: inject an adapter over the platform Firebase Storage SDK."
            .to_string(),
    }
}

fn identity_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "IdentityProvider".to_string(),
        message: "IdentityProvider implementation is required to scope remote paths to the signed-in user. \
                 Desktop: use StaticIdentity and update it on sign-in/sign-out. \
                 Mobile: wrap the platform authentication SDK's current user."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn settings_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SettingsStore".to_string(),
        message: "SettingsStore implementation is required to persist the most recent photo. \
                 Desktop: enable the 'desktop-shims' feature and set a data_dir to use the default SqliteSettingsStore. \
                 Mobile: inject platform-native settings (SharedPreferences/UserDefaults)."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_settings_store(data_dir: Option<&PathBuf>) -> Result<Arc<dyn SettingsStore>> {
    use bridge_desktop::SqliteSettingsStore;
    use std::thread;
    use tokio::runtime::{Builder, Handle};

    let data_dir = data_dir.ok_or_else(|| Error::CapabilityMissing {
        capability: "SettingsStore".to_string(),
        message: "No SettingsStore injected and no data_dir set for the default SqliteSettingsStore. \
                 Use .data_dir() or .settings_store() to provide one."
            .to_string(),
    })?;
    let path = data_dir.join("settings.db");

    let init_store = |path: PathBuf| -> Result<SqliteSettingsStore> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed to create Tokio runtime for default settings store: {}",
                    e
                ))
            })?;

        runtime
            .block_on(SqliteSettingsStore::new(path))
            .map_err(|e| {
                Error::Internal(format!("Failed to initialize default SettingsStore: {}", e))
            })
    };

    // block_on panics inside a runtime, so initialise on a helper thread there
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(move || init_store(path))
            .join()
            .map_err(|_| {
                Error::Internal(
                    "Worker thread panicked while creating default SettingsStore".to_string(),
                )
            })??,
        Err(_) => init_store(path)?,
    };

    let store: Arc<dyn SettingsStore> = Arc::new(store);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_settings_store(_data_dir: Option<&PathBuf>) -> Result<Arc<dyn SettingsStore>> {
    Err(settings_store_missing_error())
}

/// Builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    data_dir: Option<PathBuf>,
    blob_store: Option<Arc<dyn BlobStore>>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    clock: Option<Arc<dyn Clock>>,
    lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,
    tuning: SyncTuning,
}

impl EngineConfigBuilder {
    /// Sets the engine's data directory.
    ///
    /// Only needed when relying on the desktop default settings store.
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// Sets the remote object store (required).
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Sets the identity provider (required).
    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Sets the settings store (required unless `desktop-shims` provides one).
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    /// Overrides the time source. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the lifecycle observer (optional).
    pub fn lifecycle_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.lifecycle_observer = Some(observer);
        self
    }

    /// Default: 8
    pub fn max_concurrent_metadata_fetches(mut self, limit: usize) -> Self {
        self.tuning.max_concurrent_metadata_fetches = limit;
        self
    }

    /// Default: 1 second
    pub fn propagation_delay(mut self, delay: Duration) -> Self {
        self.tuning.propagation_delay = delay;
        self
    }

    /// Default: 3
    pub fn max_resolution_attempts(mut self, attempts: usize) -> Self {
        self.tuning.max_resolution_attempts = attempts;
        self
    }

    /// Default: `uploads`
    pub fn upload_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tuning.upload_prefix = prefix.into();
        self
    }

    /// Default: 100
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.tuning.event_buffer_size = size;
        self
    }

    pub fn tuning(mut self, tuning: SyncTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::CapabilityMissing`] when a required bridge is absent
    /// - [`Error::Config`] when a tuning value is out of range
    pub fn build(self) -> Result<EngineConfig> {
        self.tuning.validate()?;

        let blob_store = self.blob_store.ok_or_else(blob_store_missing_error)?;
        let identity_provider = self.identity_provider.ok_or_else(identity_missing_error)?;

        let settings_store = match self.settings_store {
            Some(store) => store,
            None => provide_default_settings_store(self.data_dir.as_ref())?,
        };

        let config = EngineConfig {
            data_dir: self.data_dir,
            blob_store,
            identity_provider,
            settings_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            lifecycle_observer: self.lifecycle_observer,
            tuning: self.tuning,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::{
        error::Result as BridgeResult, ManualClock, ObjectMetadata, OwnerId, ProgressReporter,
        RemoteRef, StaticIdentity,
    };
    use bytes::Bytes;
    use std::collections::HashMap;

    struct NullBlobStore;

    #[async_trait]
    impl BlobStore for NullBlobStore {
        async fn put(
            &self,
            path: &str,
            _data: Bytes,
            _metadata: HashMap<String, String>,
            _progress: ProgressReporter,
        ) -> BridgeResult<RemoteRef> {
            Ok(RemoteRef::new(path))
        }

        async fn list(&self, _prefix: &str) -> BridgeResult<Vec<RemoteRef>> {
            Ok(Vec::new())
        }

        async fn metadata(&self, _object: &RemoteRef) -> BridgeResult<ObjectMetadata> {
            Ok(ObjectMetadata::default())
        }

        async fn download_uri(&self, object: &RemoteRef) -> BridgeResult<String> {
            Ok(format!("mem://{}", object))
        }
    }

    struct NullSettingsStore;

    #[async_trait]
    impl SettingsStore for NullSettingsStore {
        async fn set_string(&self, _key: &str, _value: &str) -> BridgeResult<()> {
            Ok(())
        }

        async fn get_string(&self, _key: &str) -> BridgeResult<Option<String>> {
            Ok(None)
        }

        async fn set_i64(&self, _key: &str, _value: i64) -> BridgeResult<()> {
            Ok(())
        }

        async fn get_i64(&self, _key: &str) -> BridgeResult<Option<i64>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> BridgeResult<()> {
            Ok(())
        }

        async fn list_keys(&self) -> BridgeResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn complete_builder() -> EngineConfigBuilder {
        EngineConfig::builder()
            .blob_store(Arc::new(NullBlobStore))
            .identity_provider(Arc::new(StaticIdentity::new(OwnerId::new("user-1"))))
            .settings_store(Arc::new(NullSettingsStore))
    }

    #[test]
    fn test_builder_with_all_required_bridges() {
        let config = complete_builder().build().unwrap();

        assert_eq!(config.tuning, SyncTuning::default());
        assert_eq!(config.tuning.max_concurrent_metadata_fetches, 8);
        assert_eq!(config.tuning.propagation_delay, Duration::from_millis(1000));
        assert!(config.lifecycle_observer.is_none());
        assert!(config.clock.unix_timestamp_millis() > 0);
    }

    #[test]
    fn test_builder_requires_blob_store() {
        let err = EngineConfig::builder()
            .identity_provider(Arc::new(StaticIdentity::default()))
            .settings_store(Arc::new(NullSettingsStore))
            .build()
            .unwrap_err();

        assert!(matches!(err, Error::CapabilityMissing { ref capability, .. } if capability == "BlobStore"));
        assert!(err.to_string().contains("FirebaseStorageConnector"));
    }

    #[test]
    fn test_builder_requires_identity_provider() {
        let err = EngineConfig::builder()
            .blob_store(Arc::new(NullBlobStore))
            .settings_store(Arc::new(NullSettingsStore))
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("IdentityProvider"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_settings_store() {
        let err = EngineConfig::builder()
            .blob_store(Arc::new(NullBlobStore))
            .identity_provider(Arc::new(StaticIdentity::default()))
            .build()
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("SettingsStore"));
        assert!(message.contains("most recent photo"));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_desktop_default_settings_store_requires_data_dir() {
        let err = EngineConfig::builder()
            .blob_store(Arc::new(NullBlobStore))
            .identity_provider(Arc::new(StaticIdentity::default()))
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("data_dir"));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_desktop_default_settings_store_persists() {
        let dir = std::env::temp_dir().join(format!("pixpocket-config-{}", uuid::Uuid::new_v4()));

        let config = EngineConfig::builder()
            .data_dir(&dir)
            .blob_store(Arc::new(NullBlobStore))
            .identity_provider(Arc::new(StaticIdentity::default()))
            .build()
            .expect("desktop default settings store");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            config.settings_store.set_string("k", "v").await.unwrap();
            assert_eq!(
                config.settings_store.get_string("k").await.unwrap().as_deref(),
                Some("v")
            );
        });

        drop(config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_tuning_overrides() {
        let clock = Arc::new(ManualClock::new(42));
        let config = complete_builder()
            .clock(clock)
            .max_concurrent_metadata_fetches(2)
            .propagation_delay(Duration::from_millis(250))
            .max_resolution_attempts(5)
            .upload_prefix("captures/")
            .build()
            .unwrap();

        assert_eq!(config.clock.unix_timestamp_millis(), 42);
        assert_eq!(config.tuning.max_concurrent_metadata_fetches, 2);
        assert_eq!(config.tuning.max_resolution_attempts, 5);
        assert_eq!(config.tuning.owner_prefix("u1"), "captures/u1/");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let err = complete_builder()
            .max_concurrent_metadata_fetches(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_validate_rejects_long_propagation_delay() {
        let err = complete_builder()
            .propagation_delay(Duration::from_secs(120))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_rejects_blank_prefix() {
        let err = complete_builder().upload_prefix("//").build().unwrap_err();
        assert!(err.to_string().contains("upload_prefix"));
    }

    #[test]
    fn test_validate_rejects_zero_resolution_attempts() {
        assert!(complete_builder().max_resolution_attempts(0).build().is_err());
    }

    #[test]
    fn test_config_debug_hides_bridges() {
        let config = complete_builder().build().unwrap();
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("BlobStore { ... }"));
        assert!(rendered.contains("max_concurrent_metadata_fetches: 8"));
    }
}
