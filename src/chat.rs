//! Chat orchestration: retrieval augmentation plus model proxying.
//!
//! # Flow
//!
//! 1. Take the last message's `content` as the retrieval query.
//! 2. If search is configured, fetch up to [`TOP_K`] documents (failures
//!    degrade to none).
//! 3. Send `[instruction, context?, ...caller messages]` to the model.
//! 4. On success, add `meta: {kbUsed, kbDocCount}` to the model's body.
//!
//! The instruction asks the model to prefix its answer with `[KB]` or
//! `[No KB]` so callers can tell whether retrieved context was used.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::GatewayResult;
use crate::models::Message;
use crate::retrieval::{build_context, retrieve, TOP_K};
use crate::traits::{ChatModel, DocumentSearch, Services};

/// Fixed system instruction sent ahead of every conversation.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant. If a system message with context is \
provided, use it to answer when it is relevant. If your answer uses that context, begin the reply \
with [KB]. Otherwise begin the reply with [No KB].";

/// Retrieval usage attached to a successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KbMeta {
    pub kb_used: bool,
    pub kb_doc_count: usize,
}

impl KbMeta {
    fn from_count(count: usize) -> Self {
        Self {
            kb_used: count > 0,
            kb_doc_count: count,
        }
    }
}

/// Result of one chat round trip.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    /// The model answered; `body` already carries `meta`.
    Completed { body: Value, meta: KbMeta },
    /// The model endpoint returned a non-success status; passed through as-is.
    Rejected { status: u16, body: Value },
}

/// Retrieval query for a conversation: the trimmed string `content` of the
/// last message, or empty.
pub fn last_message_query(messages: &[Value]) -> String {
    messages
        .last()
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Assemble the outbound message list.
///
/// The context message is only present when `context` is non-empty; caller
/// messages follow verbatim.
pub fn build_outbound(context: &str, messages: Vec<Value>) -> Vec<Value> {
    let mut outbound = Vec::with_capacity(messages.len() + 2);
    outbound.push(Message::system(SYSTEM_PROMPT).to_value());
    if !context.is_empty() {
        outbound.push(Message::system(format!("Context:\n{}", context)).to_value());
    }
    outbound.extend(messages);
    outbound
}

/// Insert `meta` into an object body, leaving every other field untouched.
fn annotate(mut body: Value, meta: KbMeta) -> Value {
    if let Value::Object(ref mut map) = body {
        map.insert(
            "meta".to_string(),
            json!({ "kbUsed": meta.kb_used, "kbDocCount": meta.kb_doc_count }),
        );
    }
    body
}

/// Run one retrieval-augmented chat request.
///
/// `messages` must already be validated as an array by the caller.
pub async fn run_chat(
    model: &dyn ChatModel,
    search: Option<&dyn DocumentSearch>,
    messages: Vec<Value>,
    max_tokens: u32,
) -> GatewayResult<ChatOutcome> {
    let query = last_message_query(&messages);

    let docs = match search {
        Some(search) if !query.is_empty() => retrieve(search, &query, TOP_K).await,
        _ => Vec::new(),
    };
    let meta = KbMeta::from_count(docs.len());
    let context = build_context(&docs);

    let outbound = build_outbound(&context, messages);
    let reply = model.complete(&outbound, max_tokens).await?;

    if !reply.is_success() {
        return Ok(ChatOutcome::Rejected {
            status: reply.status,
            body: reply.body,
        });
    }

    Ok(ChatOutcome::Completed {
        body: annotate(reply.body, meta),
        meta,
    })
}

/// `kbchat chat`: single-turn chat from the command line.
pub async fn run_chat_command(config: &Config, message: &str) -> Result<()> {
    let services = Services::from_config(config)?;
    let Some(model) = services.model else {
        bail!("Missing Azure OpenAI configuration. Set AZURE_OPENAI_ENDPOINT and AZURE_OPENAI_API_KEY.");
    };

    let messages = vec![Message::user(message).to_value()];
    let outcome = run_chat(
        model.as_ref(),
        services.search.as_deref(),
        messages,
        config.model.max_tokens,
    )
    .await?;

    match outcome {
        ChatOutcome::Completed { body, meta } => {
            let text = body
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .unwrap_or("");
            println!("{}", text);
            println!();
            println!(
                "kb used: {} ({} documents)",
                meta.kb_used, meta.kb_doc_count
            );
        }
        ChatOutcome::Rejected { status, body } => {
            bail!("Model endpoint returned HTTP {}: {}", status, body);
        }
    }

    Ok(())
}
