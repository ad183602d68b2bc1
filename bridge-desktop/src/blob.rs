//! Directory-backed Blob Store
//!
//! Keeps objects as plain files under a root directory, with custom metadata
//! in a `<name>.meta.json` sidecar. Useful for desktop builds without a
//! cloud bucket and for end-to-end tests.
//!
//! An object becomes visible to `list` only once both its data and its
//! sidecar are on disk.

use async_trait::async_trait;
use bridge_traits::{
    blob::{BlobStore, ObjectMetadata, ProgressReporter, RemoteRef},
    error::{BridgeError, Result},
    time::{Clock, SystemClock},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const SIDECAR_SUFFIX: &str = ".meta.json";
const PARTIAL_SUFFIX: &str = ".part";
const WRITE_CHUNK: usize = 64 * 1024;

pub struct LocalBlobStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_clock(root, Arc::new(SystemClock))
    }

    /// Stamp `updated_millis` from `clock` instead of the system time.
    pub fn with_clock(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path below the root, refusing anything that
    /// could escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BridgeError::PermissionDenied(format!(
                "Object path escapes store root: {}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    fn sidecar_path(file: &Path) -> PathBuf {
        let mut name = file.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    fn partial_path(file: &Path) -> PathBuf {
        let mut name = file.as_os_str().to_os_string();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }

    fn content_type_for(path: &str) -> Option<String> {
        let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
        let mime = match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "webp" => "image/webp",
            "heic" => "image/heic",
            _ => return None,
        };
        Some(mime.to_string())
    }

    fn map_io(path: &Path, e: std::io::Error) -> BridgeError {
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                BridgeError::NotFound(path.to_string_lossy().into_owned())
            }
            std::io::ErrorKind::PermissionDenied => {
                BridgeError::PermissionDenied(path.to_string_lossy().into_owned())
            }
            _ => BridgeError::Io(e),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
        progress: ProgressReporter,
    ) -> Result<RemoteRef> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io(parent, e))?;
        }

        let partial = Self::partial_path(&target);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| Self::map_io(&partial, e))?;

        let total = data.len() as u64;
        let mut written = 0u64;
        for chunk in data.chunks(WRITE_CHUNK) {
            file.write_all(chunk)
                .await
                .map_err(|e| Self::map_io(&partial, e))?;
            written += chunk.len() as u64;
            progress.report_bytes(written, total);
        }
        file.flush().await.map_err(|e| Self::map_io(&partial, e))?;
        drop(file);

        let sidecar = ObjectMetadata {
            custom: metadata,
            updated_millis: Some(self.clock.unix_timestamp_millis()),
            size: Some(total),
            content_type: Self::content_type_for(path),
        };
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| BridgeError::OperationFailed(format!("Sidecar encoding failed: {}", e)))?;
        let sidecar_path = Self::sidecar_path(&target);
        tokio::fs::write(&sidecar_path, json)
            .await
            .map_err(|e| Self::map_io(&sidecar_path, e))?;

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| Self::map_io(&target, e))?;

        debug!(path, bytes = total, "Stored object");
        Ok(RemoteRef::new(path.trim_start_matches('/')))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteRef>> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::map_io(&dir, e)),
        };

        let base = prefix.trim_matches('/');
        let mut refs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::map_io(&dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_file || name.ends_with(SIDECAR_SUFFIX) || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            refs.push(RemoteRef::new(format!("{}/{}", base, name)));
        }

        Ok(refs)
    }

    async fn metadata(&self, object: &RemoteRef) -> Result<ObjectMetadata> {
        let file = self.resolve(object.as_str())?;
        let stat = tokio::fs::metadata(&file)
            .await
            .map_err(|e| Self::map_io(&file, e))?;

        let sidecar_path = Self::sidecar_path(&file);
        match tokio::fs::read(&sidecar_path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                BridgeError::OperationFailed(format!("Unreadable sidecar for {}: {}", object, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(object = %object, "Object has no sidecar, using file times");
                let updated_millis = stat
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64);
                Ok(ObjectMetadata {
                    custom: HashMap::new(),
                    updated_millis,
                    size: Some(stat.len()),
                    content_type: Self::content_type_for(object.as_str()),
                })
            }
            Err(e) => Err(Self::map_io(&sidecar_path, e)),
        }
    }

    async fn download_uri(&self, object: &RemoteRef) -> Result<String> {
        let file = self.resolve(object.as_str())?;
        let absolute = tokio::fs::canonicalize(&file)
            .await
            .map_err(|e| Self::map_io(&file, e))?;
        Ok(format!(
            "file://{}",
            absolute.to_string_lossy().replace('\\', "/")
        ))
    }
}
