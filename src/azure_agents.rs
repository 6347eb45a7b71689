//! Azure AI Agents adapter.
//!
//! Talks to the project endpoint's thread / message / run REST surface:
//!
//! | Call | Request |
//! |------|---------|
//! | create thread | `POST /threads` |
//! | add message | `POST /threads/{thread}/messages` |
//! | start run | `POST /threads/{thread}/runs` with `assistant_id` |
//! | run status | `GET /threads/{thread}/runs/{run}` |
//! | cancel run | `POST /threads/{thread}/runs/{run}/cancel` |
//! | messages | `GET /threads/{thread}/messages?order=asc` (cursor paged) |
//!
//! Every request carries `api-version` and an `Authorization: Bearer` token.
//! Thread and run ids are percent-encoded as single path segments.

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AgentConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{AgentRun, AgentRunStatus, ThreadMessage};
use crate::traits::AgentService;

const MESSAGE_PAGE_SIZE: u32 = 100;

pub struct AzureAgentsClient {
    client: reqwest::Client,
    config: AgentConfig,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<Value>,
}

impl From<RunResponse> for AgentRun {
    fn from(r: RunResponse) -> Self {
        AgentRun {
            id: r.id,
            status: AgentRunStatus::parse(&r.status),
            last_error: r.last_error.filter(|e| !e.is_null()),
        }
    }
}

#[derive(Deserialize)]
struct MessagePage {
    #[serde(default)]
    data: Vec<ThreadMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

impl AzureAgentsClient {
    pub fn new(client: reqwest::Client, config: AgentConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, segments: &[&str]) -> GatewayResult<Url> {
        resource_url(&self.config.endpoint, &self.config.api_version, segments)
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> GatewayResult<T> {
        let resp = req.bearer_auth(self.config.token.expose()).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(resp.url().path().to_string()));
        }
        if !resp.status().is_success() {
            return Err(GatewayError::from_response(resp).await);
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| GatewayError::Invalid(e.to_string()))
    }
}

/// `{endpoint}/{segments...}?api-version=...`, each segment encoded on its own.
fn resource_url(endpoint: &str, api_version: &str, segments: &[&str]) -> GatewayResult<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| GatewayError::Invalid(format!("agent endpoint '{}': {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| GatewayError::Invalid(format!("agent endpoint '{}' cannot be a base", endpoint)))?
        .pop_if_empty()
        .extend(segments);
    url.query_pairs_mut().append_pair("api-version", api_version);
    Ok(url)
}

#[async_trait]
impl AgentService for AzureAgentsClient {
    async fn create_thread(&self) -> GatewayResult<String> {
        let thread: IdResponse = self
            .send(self.client.post(self.url(&["threads"])?).json(&json!({})))
            .await?;
        Ok(thread.id)
    }

    async fn add_user_message(&self, thread_id: &str, content: &str) -> GatewayResult<()> {
        let _: IdResponse = self
            .send(
                self.client
                    .post(self.url(&["threads", thread_id, "messages"])?)
                    .json(&json!({ "role": "user", "content": content })),
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str) -> GatewayResult<AgentRun> {
        let run: RunResponse = self
            .send(
                self.client
                    .post(self.url(&["threads", thread_id, "runs"])?)
                    .json(&json!({ "assistant_id": self.config.agent_id })),
            )
            .await?;
        Ok(run.into())
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> GatewayResult<AgentRun> {
        let run: RunResponse = self
            .send(self.client.get(self.url(&["threads", thread_id, "runs", run_id])?))
            .await?;
        Ok(run.into())
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> GatewayResult<()> {
        let _: RunResponse = self
            .send(
                self.client
                    .post(self.url(&["threads", thread_id, "runs", run_id, "cancel"])?)
                    .json(&json!({})),
            )
            .await?;
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str) -> GatewayResult<Vec<ThreadMessage>> {
        let mut messages = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut url = self.url(&["threads", thread_id, "messages"])?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("order", "asc")
                    .append_pair("limit", &MESSAGE_PAGE_SIZE.to_string());
                if let Some(ref cursor) = after {
                    query.append_pair("after", cursor);
                }
            }

            let page: MessagePage = self.send(self.client.get(url)).await?;
            messages.extend(page.data);

            match (page.has_more, page.last_id) {
                (true, Some(last)) => after = Some(last),
                _ => break,
            }
        }

        Ok(messages)
    }
}
