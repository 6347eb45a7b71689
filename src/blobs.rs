//! Blob gateway: upload naming, listing limits and the `kbchat blobs` command.
//!
//! Uploaded files are stored under `"{unix_millis}-{suffix}-{file name}"`
//! where `suffix` is 8 random hex characters, so two uploads of the same file
//! name within the same millisecond still get distinct keys.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::error::GatewayResult;
use crate::models::{BlobInfo, UploadResult};
use crate::traits::{BlobStore, Services};

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A file received from the client, not yet stored.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Response body of `GET /api/blobs`.
#[derive(Debug, Clone, Serialize)]
pub struct BlobListing {
    pub container: String,
    pub prefix: String,
    pub count: usize,
    pub blobs: Vec<BlobInfo>,
}

/// Resolve the `limit` query parameter.
///
/// Missing, unparsable or zero values fall back to [`DEFAULT_LIST_LIMIT`];
/// anything above [`MAX_LIST_LIMIT`] is clamped.
pub fn resolve_limit(raw: Option<&str>) -> usize {
    clamp_limit(raw.and_then(|s| s.trim().parse::<usize>().ok()))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    match limit {
        Some(0) | None => DEFAULT_LIST_LIMIT,
        Some(n) => n.min(MAX_LIST_LIMIT),
    }
}

/// Reduce a client-supplied file name to its last path component.
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();
    match base {
        "" | "." | ".." => "upload".to_string(),
        name => name.to_string(),
    }
}

/// Storage key for an upload received at `now`.
pub fn blob_name_for(original: &str, now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        now.timestamp_millis(),
        &suffix[..8],
        sanitize_file_name(original)
    )
}

/// Store every file, in order, returning the assigned names.
///
/// Stops at the first failure; files stored before it are kept.
pub async fn upload_many(
    store: &dyn BlobStore,
    files: Vec<PendingUpload>,
) -> GatewayResult<Vec<UploadResult>> {
    let mut uploaded = Vec::with_capacity(files.len());
    for file in files {
        let name = blob_name_for(&file.file_name, Utc::now());
        let content_type = file
            .content_type
            .as_deref()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let size = file.data.len();
        store.put(&name, content_type, file.data).await?;
        info!(blob = %name, size, "stored upload");
        uploaded.push(UploadResult { name });
    }
    Ok(uploaded)
}

/// List blobs under `prefix`.
pub async fn list_blobs(
    store: &dyn BlobStore,
    prefix: &str,
    limit: usize,
) -> GatewayResult<BlobListing> {
    let blobs = store.list(prefix, limit).await?;
    Ok(BlobListing {
        container: store.container().to_string(),
        prefix: prefix.to_string(),
        count: blobs.len(),
        blobs,
    })
}

/// `kbchat blobs`: print a listing of the upload container.
pub async fn run_list_command(config: &Config, prefix: &str, limit: Option<usize>) -> Result<()> {
    let services = Services::from_config(config)?;
    let Some(store) = services.blobs else {
        bail!("Blob storage is not configured. Set AZURE_STORAGE_CONNECTION_STRING or AZURE_STORAGE_ACCOUNT and AZURE_STORAGE_KEY.");
    };

    let listing = list_blobs(store.as_ref(), prefix, clamp_limit(limit)).await?;

    println!(
        "{} blobs in '{}' (prefix '{}')",
        listing.count, listing.container, listing.prefix
    );
    for blob in &listing.blobs {
        println!(
            "  {:>10}  {:<25}  {}",
            blob.size,
            blob.last_modified.as_deref().unwrap_or("-"),
            blob.name
        );
    }
    Ok(())
}
