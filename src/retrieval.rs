//! Knowledge-base retrieval for chat augmentation.
//!
//! Wraps a [`DocumentSearch`] adapter with the degrade-on-failure policy used
//! by the chat orchestrator, and renders retrieved documents into the single
//! context block that is sent to the model.
//!
//! # Context Format
//!
//! ```text
//! Doc 1: <text of first document>
//!
//! Doc 2: <text of second document>
//! ```
//!
//! The whole block is capped at [`MAX_CONTEXT_CHARS`] characters.

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::models::RetrievedDocument;
use crate::traits::{DocumentSearch, Services};

/// Number of documents fetched per chat request.
pub const TOP_K: usize = 3;

/// Upper bound on the rendered context block, in characters.
pub const MAX_CONTEXT_CHARS: usize = 3500;

/// Length of the JSON fallback used when a document has no text field.
const FALLBACK_CHARS: usize = 1000;

/// Fields checked, in order, for a document's text.
const TEXT_FIELDS: [&str; 4] = ["content", "text", "chunk", "pageContent"];

/// Fetch up to `limit` documents, returning an empty list on any failure.
///
/// Retrieval is best-effort: errors are logged and never reach the caller.
pub async fn retrieve(
    search: &dyn DocumentSearch,
    query: &str,
    limit: usize,
) -> Vec<RetrievedDocument> {
    match search.ordered_documents(query, limit).await {
        Ok(mut docs) => {
            docs.truncate(limit);
            docs
        }
        Err(e) => {
            warn!(error = %e, "knowledge base retrieval failed, continuing without context");
            Vec::new()
        }
    }
}

/// Best-effort text of a document.
///
/// Returns the first non-empty string among [`TEXT_FIELDS`], otherwise the
/// compact JSON of the whole document cut to 1000 characters.
pub fn document_text(doc: &RetrievedDocument) -> String {
    for field in TEXT_FIELDS {
        if let Some(Value::String(s)) = doc.get(field) {
            if !s.trim().is_empty() {
                return s.clone();
            }
        }
    }
    let raw = serde_json::to_string(&doc.0).unwrap_or_default();
    truncate_chars(&raw, FALLBACK_CHARS)
}

/// Render documents as `Doc i:` sections, capped at [`MAX_CONTEXT_CHARS`].
///
/// Returns an empty string for an empty slice.
pub fn build_context(docs: &[RetrievedDocument]) -> String {
    let joined = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| format!("Doc {}: {}", i + 1, document_text(doc)))
        .collect::<Vec<_>>()
        .join("\n\n");
    truncate_chars(&joined, MAX_CONTEXT_CHARS)
}

/// Keep at most `max` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// `kbchat search`: print what the chat endpoint would retrieve for a query.
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if config.search.is_none() {
        bail!("Search is not configured. Set AZURE_SEARCH_ENDPOINT, AZURE_SEARCH_KEY and AZURE_SEARCH_INDEX.");
    }
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let services = Services::from_config(config)?;
    let Some(search) = services.search else {
        bail!("Search is not configured.");
    };

    // Errors are surfaced here, unlike the chat path.
    let docs = search
        .ordered_documents(query, limit.unwrap_or(TOP_K))
        .await?;

    if docs.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, doc) in docs.iter().enumerate() {
        let text = document_text(doc);
        println!("{}. {}", i + 1, truncate_chars(text.trim(), 200));
        if let Some(score) = doc.get("@search.score").and_then(Value::as_f64) {
            println!("    score: {:.4}", score);
        }
    }
    println!();
    println!("context: {} chars", build_context(&docs).chars().count());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, GatewayResult};
    use async_trait::async_trait;
    use serde_json::json;

    fn doc(v: Value) -> RetrievedDocument {
        RetrievedDocument::from_value(v).unwrap()
    }

    struct FailingSearch;

    #[async_trait]
    impl DocumentSearch for FailingSearch {
        async fn ordered_documents(
            &self,
            _query: &str,
            _limit: usize,
        ) -> GatewayResult<Vec<RetrievedDocument>> {
            Err(GatewayError::Upstream {
                status: 503,
                body: "unavailable".into(),
            })
        }
    }

    struct GreedySearch;

    #[async_trait]
    impl DocumentSearch for GreedySearch {
        async fn ordered_documents(
            &self,
            _query: &str,
            _limit: usize,
        ) -> GatewayResult<Vec<RetrievedDocument>> {
            Ok((0..10).map(|i| doc(json!({ "content": i.to_string() }))).collect())
        }
    }

    #[tokio::test]
    async fn retrieval_failure_degrades_to_empty() {
        assert!(retrieve(&FailingSearch, "anything", TOP_K).await.is_empty());
    }

    #[tokio::test]
    async fn retrieval_never_exceeds_limit() {
        assert_eq!(retrieve(&GreedySearch, "q", TOP_K).await.len(), TOP_K);
    }

    #[test]
    fn text_field_precedence() {
        assert_eq!(document_text(&doc(json!({"text": "t", "content": "c"}))), "c");
        assert_eq!(document_text(&doc(json!({"chunk": "k", "text": "t"}))), "t");
        assert_eq!(document_text(&doc(json!({"pageContent": "p"}))), "p");
        assert_eq!(document_text(&doc(json!({"content": "", "chunk": "k"}))), "k");
    }

    #[test]
    fn fallback_serializes_whole_document() {
        let text = document_text(&doc(json!({"title": "Runbook", "id": 7})));
        assert!(text.contains("Runbook"));

        let big = "x".repeat(5000);
        let text = document_text(&doc(json!({ "blob": big })));
        assert_eq!(text.chars().count(), FALLBACK_CHARS);
    }

    #[test]
    fn context_prefixes_each_document() {
        let ctx = build_context(&[doc(json!({"content": "alpha"})), doc(json!({"text": "beta"}))]);
        assert_eq!(ctx, "Doc 1: alpha\n\nDoc 2: beta");
    }

    #[test]
    fn context_empty_without_documents() {
        assert_eq!(build_context(&[]), "");
    }

    #[test]
    fn context_is_capped() {
        let docs: Vec<_> = (0..3)
            .map(|_| doc(json!({ "content": "é".repeat(4000) })))
            .collect();
        let ctx = build_context(&docs);
        assert_eq!(ctx.chars().count(), MAX_CONTEXT_CHARS);
        assert!(ctx.starts_with("Doc 1: "));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
