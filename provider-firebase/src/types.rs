//! Firebase Storage REST response types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Object resource as returned by `GET /v0/b/{bucket}/o/{name}` and by
/// uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObject {
    /// Full object path
    pub name: String,

    #[serde(default)]
    pub bucket: Option<String>,

    /// Size in bytes, encoded as a decimal string
    #[serde(default)]
    pub size: Option<String>,

    #[serde(default)]
    pub content_type: Option<String>,

    /// Last modification time (RFC 3339)
    #[serde(default)]
    pub updated: Option<String>,

    /// Custom metadata
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,

    /// Comma-separated download tokens
    #[serde(default)]
    pub download_tokens: Option<String>,
}

impl StorageObject {
    pub fn first_download_token(&self) -> Option<&str> {
        self.download_tokens
            .as_deref()?
            .split(',')
            .map(str::trim)
            .find(|t| !t.is_empty())
    }
}

/// Listing page
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    /// Objects directly under the prefix. Listing entries carry little more
    /// than the name.
    #[serde(default)]
    pub items: Vec<ListItem>,

    /// Sub-folders (not descended into)
    #[serde(default)]
    pub prefixes: Vec<String>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListItem {
    pub name: String,
}

/// JSON part of a multipart upload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata<'a> {
    pub name: &'a str,
    pub content_type: &'a str,
    pub metadata: &'a HashMap<String, String>,
}
