//! Azure AI Search adapter.
//!
//! Issues a simple full-text query against
//! `POST {endpoint}/indexes/{index}/docs/search?api-version=…` and returns the
//! `value` array in rank order. Authenticates with the `api-key` header.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::SearchConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::RetrievedDocument;
use crate::traits::DocumentSearch;

pub struct AzureSearchClient {
    client: reqwest::Client,
    config: SearchConfig,
}

impl AzureSearchClient {
    pub fn new(client: reqwest::Client, config: SearchConfig) -> Self {
        Self { client, config }
    }

    fn search_url(&self) -> String {
        format!(
            "{}/indexes/{}/docs/search?api-version={}",
            self.config.endpoint, self.config.index, self.config.api_version
        )
    }
}

#[async_trait]
impl DocumentSearch for AzureSearchClient {
    async fn ordered_documents(
        &self,
        query: &str,
        limit: usize,
    ) -> GatewayResult<Vec<RetrievedDocument>> {
        let body = json!({
            "search": query,
            "top": limit,
        });

        let resp = self
            .client
            .post(self.search_url())
            .header("api-key", self.config.api_key.expose())
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(GatewayError::from_response(resp).await);
        }

        let json: Value = resp.json().await?;
        parse_search_response(json, limit)
    }
}

/// Extract ranked documents from a search response body.
///
/// Non-object entries are skipped; the result never exceeds `limit`.
fn parse_search_response(json: Value, limit: usize) -> GatewayResult<Vec<RetrievedDocument>> {
    let values = match json {
        Value::Object(mut map) => match map.remove("value") {
            Some(Value::Array(values)) => values,
            _ => {
                return Err(GatewayError::Invalid(
                    "search response is missing the value array".to_string(),
                ))
            }
        },
        _ => {
            return Err(GatewayError::Invalid(
                "search response is not an object".to_string(),
            ))
        }
    };

    Ok(values
        .into_iter()
        .filter_map(RetrievedDocument::from_value)
        .take(limit)
        .collect())
}
