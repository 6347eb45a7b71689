//! Agent orchestration: run one prompt to completion on a hosted agent.
//!
//! ```text
//! create thread → add user message → start run
//!        → poll while queued / in_progress (backoff, bounded)
//!        → failed?  → AgentOutcome::Failed
//!        → other    → list messages (asc) → transcript
//! ```
//!
//! Polling starts at the configured interval, doubles after every poll up to
//! the configured cap, and gives up after the configured timeout. A timed-out
//! run is cancelled on a best-effort basis.

use anyhow::{bail, Result};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, PollConfig};
use crate::error::GatewayResult;
use crate::models::{AgentRunStatus, TranscriptEntry};
use crate::traits::{AgentService, Services};

/// Poll schedule for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &PollConfig) -> Self {
        Self {
            initial_interval: config.initial_interval(),
            max_interval: config.max_interval(),
            timeout: config.timeout(),
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&PollConfig::default())
    }
}

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// Any terminal status other than `failed`.
    Finished {
        status: AgentRunStatus,
        transcript: Vec<TranscriptEntry>,
    },
    /// The run reported `failed`; `last_error` is the service's error object.
    Failed { last_error: Option<Value> },
    /// The run was still pending when the poll timeout elapsed.
    TimedOut { run_id: String, waited: Duration },
}

/// Pick the prompt from a request body: the first non-blank string among
/// `prompt`, `message` and `text`.
pub fn extract_prompt(body: &Value) -> Option<String> {
    ["prompt", "message", "text"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Run `prompt` on a fresh thread and wait for the run to leave
/// `queued` / `in_progress`.
pub async fn run_agent(
    service: &dyn AgentService,
    prompt: &str,
    policy: &PollPolicy,
) -> GatewayResult<AgentOutcome> {
    let thread_id = service.create_thread().await?;
    service.add_user_message(&thread_id, prompt).await?;
    let mut run = service.create_run(&thread_id).await?;
    info!(thread = %thread_id, run = %run.id, "agent run started");

    let started = Instant::now();
    let mut interval = policy.initial_interval;

    while run.status.is_pending() {
        let waited = started.elapsed();
        if waited >= policy.timeout {
            warn!(run = %run.id, waited_ms = waited.as_millis() as u64, "agent run timed out, cancelling");
            if let Err(e) = service.cancel_run(&thread_id, &run.id).await {
                warn!(run = %run.id, error = %e, "failed to cancel agent run");
            }
            return Ok(AgentOutcome::TimedOut {
                run_id: run.id,
                waited,
            });
        }

        tokio::time::sleep(interval.min(policy.timeout - waited)).await;
        run = service.get_run(&thread_id, &run.id).await?;
        debug!(run = %run.id, status = run.status.as_str(), "agent run polled");
        interval = policy.next_interval(interval);
    }

    if run.status == AgentRunStatus::Failed {
        warn!(run = %run.id, "agent run failed");
        return Ok(AgentOutcome::Failed {
            last_error: run.last_error,
        });
    }

    let transcript = service
        .list_messages(&thread_id)
        .await?
        .iter()
        .filter_map(|m| {
            m.first_text().map(|text| TranscriptEntry {
                role: m.role.clone(),
                text: text.to_string(),
            })
        })
        .collect();

    Ok(AgentOutcome::Finished {
        status: run.status,
        transcript,
    })
}

/// `kbchat agent`: run a prompt and print the transcript.
pub async fn run_agent_command(config: &Config, prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        bail!("prompt must not be empty");
    }
    let services = Services::from_config(config)?;
    let Some(agent) = services.agent else {
        bail!("Agent is not configured. Set AZURE_AI_PROJECT_ENDPOINT, AZURE_AI_AGENT_ID and AZURE_AI_AGENT_TOKEN.");
    };

    let policy = PollPolicy::from_config(&config.poll);
    match run_agent(agent.as_ref(), prompt.trim(), &policy).await? {
        AgentOutcome::Finished { status, transcript } => {
            println!("status: {}", status.as_str());
            for entry in transcript {
                println!("[{}] {}", entry.role, entry.text);
            }
        }
        AgentOutcome::Failed { last_error } => {
            bail!(
                "Agent run failed: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            );
        }
        AgentOutcome::TimedOut { run_id, waited } => {
            bail!("Agent run {} timed out after {:?}", run_id, waited);
        }
    }
    Ok(())
}
