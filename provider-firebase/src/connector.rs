//! Firebase Storage REST connector
//!
//! Implements [`BlobStore`] against the Firebase Storage v0 REST API.

use async_trait::async_trait;
use bridge_traits::blob::{BlobStore, ObjectMetadata, ProgressReporter, RemoteRef};
use bridge_traits::error::Result;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::DateTime;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::FirebaseError;
use crate::types::{ListResponse, StorageObject, UploadMetadata};

/// Firebase Storage REST base URL
pub const FIREBASE_STORAGE_BASE: &str = "https://firebasestorage.googleapis.com/v0";

/// Attempts for idempotent read calls
const MAX_READ_ATTEMPTS: u32 = 3;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Firebase Storage connector
///
/// # Features
///
/// - Paginated, non-recursive listing of one folder
/// - Object metadata with custom `metadata` map and `updated` time
/// - Single-request multipart uploads, so custom metadata is never
///   observable apart from the object
/// - Token-based download URIs
/// - Exponential backoff on transient read failures
///
/// # Example
///
/// ```ignore
/// use provider_firebase::FirebaseStorageConnector;
///
/// let connector = FirebaseStorageConnector::new(http_client, "my-app.appspot.com");
/// connector.set_id_token(Some(id_token));
/// let refs = connector.list("uploads/abc123/").await?;
/// ```
pub struct FirebaseStorageConnector {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    bucket: String,
    /// Firebase Auth ID token of the signed-in user
    id_token: RwLock<Option<String>>,
    retry_base_delay: Duration,
}

impl FirebaseStorageConnector {
    pub fn new(http_client: Arc<dyn HttpClient>, bucket: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: FIREBASE_STORAGE_BASE.to_string(),
            bucket: bucket.into(),
            id_token: RwLock::new(None),
            retry_base_delay: Duration::from_millis(200),
        }
    }

    /// Point at another endpoint, e.g. the Storage emulator.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Replace the ID token sent with every request. `None` sends
    /// unauthenticated requests.
    pub fn set_id_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.id_token.write() {
            *guard = token;
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn objects_url(&self) -> String {
        format!(
            "{}/b/{}/o",
            self.base_url,
            urlencoding::encode(&self.bucket)
        )
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.objects_url(), urlencoding::encode(name))
    }

    fn authorize(&self, request: HttpRequest) -> HttpRequest {
        let token = self.id_token.read().ok().and_then(|guard| guard.clone());
        match token {
            Some(token) => request.header("Authorization", format!("Firebase {}", token)),
            None => request,
        }
    }

    fn content_type_for(path: &str) -> &'static str {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            Some("heic") => "image/heic",
            _ => "application/octet-stream",
        }
    }

    /// Parse RFC 3339 timestamp to Unix millis
    fn parse_timestamp(rfc3339: &str) -> Option<i64> {
        DateTime::parse_from_rfc3339(rfc3339)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }

    fn convert_object(object: StorageObject) -> ObjectMetadata {
        ObjectMetadata {
            custom: object.metadata.unwrap_or_default(),
            updated_millis: object.updated.as_deref().and_then(Self::parse_timestamp),
            size: object.size.and_then(|s| s.parse().ok()),
            content_type: object.content_type,
        }
    }

    fn check_status(response: &HttpResponse) -> std::result::Result<(), FirebaseError> {
        if response.is_success() {
            return Ok(());
        }
        Err(FirebaseError::ApiError {
            status_code: response.status,
            message: response.text_lossy(),
        })
    }

    fn parse<T: serde::de::DeserializeOwned>(
        response: &HttpResponse,
        what: &str,
    ) -> std::result::Result<T, FirebaseError> {
        serde_json::from_slice(&response.body)
            .map_err(|e| FirebaseError::ParseError(format!("Failed to parse {}: {}", what, e)))
    }

    /// GET with exponential backoff on transient failures.
    #[instrument(skip(self), fields(url = %url))]
    async fn get_with_retry(&self, url: String) -> std::result::Result<HttpResponse, FirebaseError> {
        let mut attempt = 0;

        loop {
            let request = self.authorize(
                HttpRequest::new(HttpMethod::Get, url.clone())
                    .header("Accept", "application/json")
                    .timeout(READ_TIMEOUT),
            );

            let error = match self.http_client.execute(request).await {
                Ok(response) => match Self::check_status(&response) {
                    Ok(()) => return Ok(response),
                    Err(e) => e,
                },
                Err(e) => FirebaseError::BridgeError(e),
            };

            attempt += 1;
            if !error.is_transient() || attempt >= MAX_READ_ATTEMPTS {
                warn!(attempt, error = %error, "Read request failed");
                return Err(error);
            }

            let backoff = self.retry_base_delay * 2u32.pow(attempt - 1);
            warn!(
                attempt,
                max_attempts = MAX_READ_ATTEMPTS,
                error = %error,
                backoff_ms = backoff.as_millis() as u64,
                "Transient read failure, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn fetch_object(&self, name: &str) -> std::result::Result<StorageObject, FirebaseError> {
        let response = self.get_with_retry(self.object_url(name)).await?;
        Self::parse(&response, "object metadata")
    }

    /// `multipart/related` body: JSON metadata part, then the media part.
    fn multipart_body(
        boundary: &str,
        metadata_json: &[u8],
        content_type: &str,
        data: &[u8],
    ) -> Bytes {
        let mut body = BytesMut::with_capacity(data.len() + metadata_json.len() + 256);
        body.put_slice(format!("--{}\r\n", boundary).as_bytes());
        body.put_slice(b"Content-Type: application/json; charset=utf-8\r\n\r\n");
        body.put_slice(metadata_json);
        body.put_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
        body.put_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.put_slice(data);
        body.put_slice(format!("\r\n--{}--", boundary).as_bytes());
        body.freeze()
    }
}

#[async_trait]
impl BlobStore for FirebaseStorageConnector {
    #[instrument(skip(self, data, metadata, progress), fields(path = %path, bytes = data.len()))]
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
        progress: ProgressReporter,
    ) -> Result<RemoteRef> {
        let content_type = Self::content_type_for(path);
        let metadata_json = serde_json::to_vec(&UploadMetadata {
            name: path,
            content_type,
            metadata: &metadata,
        })
        .map_err(|e| FirebaseError::ParseError(format!("Failed to encode metadata: {}", e)))?;

        let boundary = format!("pixpocket-{}", uuid::Uuid::new_v4().simple());
        let body = Self::multipart_body(&boundary, &metadata_json, content_type, &data);

        let url = format!("{}?name={}", self.objects_url(), urlencoding::encode(path));
        let request = self.authorize(
            HttpRequest::new(HttpMethod::Post, url)
                .header("X-Goog-Upload-Protocol", "multipart")
                .header(
                    "Content-Type",
                    format!("multipart/related; boundary={}", boundary),
                )
                .body(body)
                .timeout(UPLOAD_TIMEOUT),
        );

        // Uploads are not idempotent from the caller's point of view and are
        // never retried here.
        let response = self.http_client.execute(request).await?;
        Self::check_status(&response)?;
        progress.report(1.0);

        let stored: StorageObject = Self::parse(&response, "upload response")?;
        info!(name = %stored.name, "Uploaded object");
        Ok(RemoteRef::new(stored.name))
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteRef>> {
        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}?prefix={}&delimiter={}",
                self.objects_url(),
                urlencoding::encode(prefix),
                urlencoding::encode("/")
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let response = self.get_with_retry(url).await?;
            let page: ListResponse = Self::parse(&response, "listing")?;

            refs.extend(
                page.items
                    .into_iter()
                    .filter(|item| !item.name.ends_with('/'))
                    .map(|item| RemoteRef::new(item.name)),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(count = refs.len(), "Listed objects");
        Ok(refs)
    }

    #[instrument(skip(self), fields(object = %object))]
    async fn metadata(&self, object: &RemoteRef) -> Result<ObjectMetadata> {
        let stored = self.fetch_object(object.as_str()).await?;
        Ok(Self::convert_object(stored))
    }

    #[instrument(skip(self), fields(object = %object))]
    async fn download_uri(&self, object: &RemoteRef) -> Result<String> {
        let stored = self.fetch_object(object.as_str()).await?;
        let token = stored
            .first_download_token()
            .ok_or_else(|| FirebaseError::MissingDownloadToken(object.to_string()))?;

        Ok(format!(
            "{}?alt=media&token={}",
            self.object_url(object.as_str()),
            urlencoding::encode(token)
        ))
    }
}
