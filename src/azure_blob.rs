//! Azure Blob Storage adapter.
//!
//! Uploads, lists and streams blobs in a single container using the Blob
//! service REST API with
//! [Shared Key](https://learn.microsoft.com/rest/api/storageservices/authorize-with-shared-key)
//! authorization. Signing is HMAC-SHA256 over a canonical request string
//! (`hmac` + `sha2`), so no Azure SDK is needed and Azurite works through a
//! custom `BlobEndpoint`.
//!
//! # Operations
//!
//! | Operation | Request |
//! |-----------|---------|
//! | upload | `PUT /{container}/{blob}` with `x-ms-blob-type: BlockBlob` |
//! | list | `GET /{container}?restype=container&comp=list` (paged by `marker`) |
//! | download | `GET /{container}/{blob}`, streamed |
//!
//! A 404 from the service maps to [`GatewayError::NotFound`] for both a
//! missing container and a missing blob.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use sha2::Sha256;

use crate::config::StorageConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::BlobInfo;
use crate::traits::{BlobDownload, BlobStore};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-08-06";

/// Page size requested from `List Blobs`; the service caps it at 5000.
const LIST_PAGE_SIZE: usize = 1000;

pub struct AzureBlobClient {
    client: reqwest::Client,
    account: String,
    key: Vec<u8>,
    /// Endpoint without trailing slash, e.g. `https://acct.blob.core.windows.net`.
    endpoint: String,
    /// Path component of the endpoint (empty for the public cloud, `/devstoreaccount1` for Azurite).
    base_path: String,
    container: String,
}

impl AzureBlobClient {
    pub fn new(client: reqwest::Client, config: &StorageConfig) -> Result<Self> {
        let key = BASE64
            .decode(config.account_key.expose())
            .context("storage account key is not valid base64")?;
        let url = reqwest::Url::parse(&config.endpoint)
            .with_context(|| format!("invalid blob endpoint: {}", config.endpoint))?;
        let base_path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            account: config.account.clone(),
            key,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            base_path,
            container: config.container.clone(),
        })
    }

    fn container_path(&self) -> String {
        format!("{}/{}", self.base_path, uri_encode(&self.container))
    }

    fn blob_path(&self, name: &str) -> String {
        let encoded = name.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        format!("{}/{}", self.container_path(), encoded)
    }

    fn url_for(&self, path: &str, query: &[(String, String)]) -> String {
        let origin = self.endpoint.strip_suffix(&self.base_path).unwrap_or(&self.endpoint);
        if query.is_empty() {
            format!("{}{}", origin, path)
        } else {
            let qs = query
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            format!("{}{}?{}", origin, path, qs)
        }
    }

    /// Build and sign a request.
    ///
    /// `extra_headers` must be `x-ms-*` headers; they are included in the
    /// canonicalized header block together with `x-ms-date` and `x-ms-version`.
    fn signed_request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        extra_headers: &[(&str, String)],
        content_type: Option<&str>,
        content_length: Option<usize>,
    ) -> reqwest::RequestBuilder {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date),
            ("x-ms-version".to_string(), API_VERSION.to_string()),
        ];
        for (k, v) in extra_headers {
            ms_headers.push((k.to_ascii_lowercase(), v.clone()));
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let string_to_sign = string_to_sign(
            method.as_str(),
            content_length,
            content_type,
            &ms_headers,
            &canonical_resource(&self.account, path, query),
        );
        let signature = BASE64.encode(hmac_sha256(&self.key, string_to_sign.as_bytes()));

        let mut builder = self
            .client
            .request(method, self.url_for(path, query))
            .header("Authorization", format!("SharedKey {}:{}", self.account, signature));
        for (k, v) in &ms_headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        // Content-Length is set by reqwest from the body; it is only signed here.
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        builder
    }
}

#[async_trait]
impl BlobStore for AzureBlobClient {
    fn container(&self) -> &str {
        &self.container
    }

    async fn put(&self, name: &str, content_type: &str, data: Vec<u8>) -> GatewayResult<()> {
        let len = data.len();
        let resp = self
            .signed_request(
                Method::PUT,
                &self.blob_path(name),
                &[],
                &[("x-ms-blob-type", "BlockBlob".to_string())],
                Some(content_type),
                Some(len),
            )
            .body(data)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound(format!(
                "container '{}'",
                self.container
            ))),
            _ => Err(GatewayError::from_response(resp).await),
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> GatewayResult<Vec<BlobInfo>> {
        let mut blobs: Vec<BlobInfo> = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let remaining = limit.saturating_sub(blobs.len());
            if remaining == 0 {
                break;
            }

            let mut query = vec![
                ("comp".to_string(), "list".to_string()),
                (
                    "maxresults".to_string(),
                    remaining.min(LIST_PAGE_SIZE).to_string(),
                ),
                ("restype".to_string(), "container".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref m) = marker {
                query.push(("marker".to_string(), m.clone()));
            }

            let resp = self
                .signed_request(Method::GET, &self.container_path(), &query, &[], None, None)
                .send()
                .await?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Err(GatewayError::NotFound(format!(
                    "container '{}'",
                    self.container
                )));
            }
            if !resp.status().is_success() {
                return Err(GatewayError::from_response(resp).await);
            }

            let xml = resp.text().await?;
            let (batch, next_marker) = parse_list_blobs_response(&xml);
            blobs.extend(batch);

            match next_marker {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }

        blobs.truncate(limit);
        Ok(blobs)
    }

    async fn open(&self, name: &str) -> GatewayResult<BlobDownload> {
        let resp = self
            .signed_request(Method::GET, &self.blob_path(name), &[], &[], None, None)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(format!("blob '{}'", name)));
        }
        if !resp.status().is_success() {
            return Err(GatewayError::from_response(resp).await);
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(BlobDownload {
            content_type,
            content_length,
            body,
        })
    }
}

// ============ Shared Key Helpers ============

/// Canonicalized resource: `/{account}{path}` followed by one
/// `\n{name}:{value}` line per query parameter, names lowercased and sorted.
fn canonical_resource(account: &str, path: &str, query: &[(String, String)]) -> String {
    let mut resource = format!("/{}{}", account, path);
    let mut params: Vec<(String, &str)> = query
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    for (k, v) in params {
        resource.push('\n');
        resource.push_str(&k);
        resource.push(':');
        resource.push_str(v);
    }
    resource
}

/// Shared Key string-to-sign for the Blob service (version 2015-02-21+).
///
/// ```text
/// VERB \n Content-Encoding \n Content-Language \n Content-Length \n
/// Content-MD5 \n Content-Type \n Date \n If-Modified-Since \n If-Match \n
/// If-None-Match \n If-Unmodified-Since \n Range \n
/// CanonicalizedHeaders CanonicalizedResource
/// ```
///
/// A zero content length is signed as an empty string.
fn string_to_sign(
    verb: &str,
    content_length: Option<usize>,
    content_type: Option<&str>,
    ms_headers: &[(String, String)],
    canonical_resource: &str,
) -> String {
    let length = match content_length {
        Some(0) | None => String::new(),
        Some(n) => n.to_string(),
    };
    let canonical_headers: String = ms_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    format!(
        "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}",
        verb,
        length,
        content_type.unwrap_or(""),
        canonical_headers,
        canonical_resource
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// URI-encode a string per RFC 3986.
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

/// Parse a `List Blobs` XML response into [`BlobInfo`]s plus the
/// `NextMarker` for the following page.
fn parse_list_blobs_response(xml: &str) -> (Vec<BlobInfo>, Option<String>) {
    let mut blobs = Vec::new();
    let next_marker = extract_xml_value(xml, "NextMarker");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Blob>") {
        let block_start = start + "<Blob>".len();
        let Some(end) = remaining[block_start..].find("</Blob>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Blob>".len()..];

        let name = match extract_xml_value(block, "Name") {
            Some(n) if !n.is_empty() => n,
            _ => continue,
        };

        let size = extract_xml_value(block, "Content-Length")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let content_type = extract_xml_value(block, "Content-Type").filter(|s| !s.is_empty());

        let last_modified = extract_xml_value(block, "Last-Modified")
            .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
            .map(|dt| dt.with_timezone(&Utc).to_rfc3339());

        blobs.push(BlobInfo {
            name,
            size,
            content_type,
            last_modified,
        });
    }

    (blobs, next_marker)
}

/// Extract the unescaped text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(unescape_xml(&xml[start..start + end]))
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
