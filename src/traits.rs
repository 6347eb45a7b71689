//! Adapter traits for the external services.
//!
//! Every external dependency sits behind one trait so the orchestrators in
//! [`crate::chat`], [`crate::agent`] and [`crate::blobs`] never see a concrete
//! client. The Azure implementations live in the `azure_*` modules; tests
//! swap in in-memory fakes.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Services                     │
//! │  ┌──────────┐ ┌───────────┐ ┌──────┐ ┌─────┐ │
//! │  │ChatModel │ │DocSearch  │ │Blobs │ │Agent│ │
//! │  │ (OpenAI) │ │(AI Search)│ │(Blob)│ │(AI) │ │
//! │  └──────────┘ └───────────┘ └──────┘ └─────┘ │
//! └──────────────────────┬────────────────────────┘
//!                        ▼
//!          chat / agent / blobs orchestrators
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use kbchat::error::GatewayResult;
//! use kbchat::models::RetrievedDocument;
//! use kbchat::traits::DocumentSearch;
//!
//! struct NoResults;
//!
//! #[async_trait]
//! impl DocumentSearch for NoResults {
//!     async fn ordered_documents(
//!         &self,
//!         _query: &str,
//!         _limit: usize,
//!     ) -> GatewayResult<Vec<RetrievedDocument>> {
//!         Ok(vec![])
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::azure_agents::AzureAgentsClient;
use crate::azure_blob::AzureBlobClient;
use crate::azure_openai::AzureOpenAiClient;
use crate::azure_search::AzureSearchClient;
use crate::config::Config;
use crate::error::GatewayResult;
use crate::models::{AgentRun, BlobInfo, RetrievedDocument, ThreadMessage};

// ═══════════════════════════════════════════════════════════════════════
// Chat model
// ═══════════════════════════════════════════════════════════════════════

/// Raw reply from the model endpoint.
///
/// Non-success statuses are returned here rather than as errors: the chat
/// endpoint passes them through to its caller unchanged.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub status: u16,
    pub body: Value,
}

impl ModelReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A hosted chat completion endpoint.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send the full message list with a generation cap.
    ///
    /// Transport failures and non-JSON bodies are errors; any HTTP status
    /// with a JSON body is a [`ModelReply`].
    async fn complete(&self, messages: &[Value], max_tokens: u32) -> GatewayResult<ModelReply>;
}

// ═══════════════════════════════════════════════════════════════════════
// Search
// ═══════════════════════════════════════════════════════════════════════

/// A search index that returns ranked documents for a query.
#[async_trait]
pub trait DocumentSearch: Send + Sync {
    /// Return at most `limit` documents, best first.
    async fn ordered_documents(
        &self,
        query: &str,
        limit: usize,
    ) -> GatewayResult<Vec<RetrievedDocument>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Blob storage
// ═══════════════════════════════════════════════════════════════════════

/// An opened blob, ready to stream.
///
/// Produced only after the store has confirmed the blob exists, so callers
/// can map [`crate::error::GatewayError::NotFound`] to a 404 before any body
/// bytes are read.
pub struct BlobDownload {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

/// A single container in an object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of the container this store writes to.
    fn container(&self) -> &str;

    /// Store `data` under `name`, overwriting any existing blob.
    async fn put(&self, name: &str, content_type: &str, data: Vec<u8>) -> GatewayResult<()>;

    /// List up to `limit` blobs whose names start with `prefix`.
    async fn list(&self, prefix: &str, limit: usize) -> GatewayResult<Vec<BlobInfo>>;

    /// Open a blob for streaming.
    async fn open(&self, name: &str) -> GatewayResult<BlobDownload>;
}

// ═══════════════════════════════════════════════════════════════════════
// Agent service
// ═══════════════════════════════════════════════════════════════════════

/// A hosted agent exposing the thread / message / run lifecycle.
///
/// The run state machine is owned by the service; implementations only
/// report what they observe.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Create an empty conversation thread and return its id.
    async fn create_thread(&self) -> GatewayResult<String>;

    /// Append a user message to a thread.
    async fn add_user_message(&self, thread_id: &str, content: &str) -> GatewayResult<()>;

    /// Start a run of the configured agent on a thread.
    async fn create_run(&self, thread_id: &str) -> GatewayResult<AgentRun>;

    /// Fetch the current state of a run.
    async fn get_run(&self, thread_id: &str, run_id: &str) -> GatewayResult<AgentRun>;

    /// Ask the service to cancel a run.
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> GatewayResult<()>;

    /// All messages of a thread in ascending creation order.
    async fn list_messages(&self, thread_id: &str) -> GatewayResult<Vec<ThreadMessage>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Services
// ═══════════════════════════════════════════════════════════════════════

/// The set of configured adapters, built once at startup.
///
/// A `None` slot means the capability is not configured.
#[derive(Clone, Default)]
pub struct Services {
    pub model: Option<Arc<dyn ChatModel>>,
    pub search: Option<Arc<dyn DocumentSearch>>,
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub agent: Option<Arc<dyn AgentService>>,
}

impl Services {
    /// Build the Azure adapters for every configured capability.
    ///
    /// All adapters share one `reqwest::Client` so connections are pooled.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .build()?;

        let model: Option<Arc<dyn ChatModel>> =
            match (&config.model.endpoint, &config.model.api_key) {
                (Some(endpoint), Some(key)) => Some(Arc::new(AzureOpenAiClient::new(
                    client.clone(),
                    endpoint.clone(),
                    key.clone(),
                ))),
                _ => None,
            };

        let search: Option<Arc<dyn DocumentSearch>> = match &config.search {
            Some(cfg) => Some(Arc::new(AzureSearchClient::new(client.clone(), cfg.clone()))),
            None => None,
        };

        let blobs: Option<Arc<dyn BlobStore>> = match &config.storage {
            Some(cfg) => Some(Arc::new(AzureBlobClient::new(client.clone(), cfg)?)),
            None => None,
        };

        let agent: Option<Arc<dyn AgentService>> = match &config.agent {
            Some(cfg) => Some(Arc::new(AzureAgentsClient::new(client, cfg.clone()))),
            None => None,
        };

        Ok(Self {
            model,
            search,
            blobs,
            agent,
        })
    }
}
