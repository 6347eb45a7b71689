//! Azure OpenAI chat completions adapter.
//!
//! `AZURE_OPENAI_ENDPOINT` is the full deployment URL including
//! `api-version`, e.g.
//! `https://<res>.openai.azure.com/openai/deployments/<dep>/chat/completions?api-version=2024-02-15-preview`.
//! Requests authenticate with the `api-key` header.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Secret;
use crate::error::{GatewayError, GatewayResult};
use crate::traits::{ChatModel, ModelReply};

pub struct AzureOpenAiClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Secret,
}

impl AzureOpenAiClient {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: Secret) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl ChatModel for AzureOpenAiClient {
    async fn complete(&self, messages: &[Value], max_tokens: u32) -> GatewayResult<ModelReply> {
        let body = json!({
            "messages": messages,
            "max_tokens": max_tokens,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header("api-key", self.api_key.expose())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::Invalid(format!("model returned HTTP {} with a non-JSON body: {}", status, e))
        })?;

        Ok(ModelReply { status, body })
    }
}
