//! Environment-driven configuration.
//!
//! The process environment is read exactly once at startup into an immutable
//! [`Config`], which is then shared with every handler through `Arc`. Each
//! external capability (model, search, blob storage, agent service) is an
//! `Option`: if any of its required variables is missing or empty, the
//! capability is simply disabled and the corresponding endpoints report a
//! configuration error instead of failing startup.
//!
//! # Environment Variables
//!
//! | Variable | Purpose |
//! |----------|---------|
//! | `PORT`, `BIND_ADDR`, `STATIC_DIR` | HTTP listener and static file root |
//! | `AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_API_KEY` | chat completions deployment |
//! | `AZURE_SEARCH_ENDPOINT`, `AZURE_SEARCH_KEY`, `AZURE_SEARCH_INDEX` | retrieval index |
//! | `AZURE_STORAGE_CONNECTION_STRING` or `AZURE_STORAGE_ACCOUNT` + `AZURE_STORAGE_KEY` | blob account |
//! | `AZURE_STORAGE_CONTAINER` | upload container (default `uploads`) |
//! | `AZURE_AI_PROJECT_ENDPOINT`, `AZURE_AI_AGENT_ID`, `AZURE_AI_AGENT_TOKEN` | hosted agent |
//! | `AGENT_POLL_INTERVAL_MS`, `AGENT_POLL_MAX_INTERVAL_MS`, `AGENT_RUN_TIMEOUT_SECS` | run polling |
//!
//! Secrets are held in [`Secret`], whose `Debug` output is redacted.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Account name and key of the local Azurite storage emulator.
const DEV_STORAGE_ACCOUNT: &str = "devstoreaccount1";
const DEV_STORAGE_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_STORAGE_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// Static file root used when `STATIC_DIR` is unset.
const DEFAULT_STATIC_DIR: &str = "public";

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub search: Option<SearchConfig>,
    pub storage: Option<StorageConfig>,
    pub agent: Option<AgentConfig>,
    pub poll: PollConfig,
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Chat completions deployment. Endpoint and key are tracked separately so
/// the health endpoint can report each one.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<Secret>,
    pub max_tokens: u32,
}

impl ModelConfig {
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.api_key.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub endpoint: String,
    pub api_key: Secret,
    pub index: String,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub account: String,
    pub account_key: Secret,
    /// Blob service base URL without a trailing slash.
    pub endpoint: String,
    pub container: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: String,
    pub agent_id: String,
    pub token: Secret,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub timeout_secs: u64,
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1000,
            max_interval_ms: 8000,
            timeout_secs: 120,
        }
    }
}

/// A credential that never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup.
    ///
    /// Empty or whitespace-only values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let server = ServerConfig {
            bind: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(var("PORT"), "PORT", 3000)?,
            static_dir: var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR)),
            max_upload_bytes: parse_or::<usize>(var("MAX_UPLOAD_MB"), "MAX_UPLOAD_MB", 50)?
                * 1024
                * 1024,
        };

        let model = ModelConfig {
            endpoint: var("AZURE_OPENAI_ENDPOINT"),
            api_key: var("AZURE_OPENAI_API_KEY").map(Secret::new),
            max_tokens: parse_or(var("AZURE_OPENAI_MAX_TOKENS"), "AZURE_OPENAI_MAX_TOKENS", 256)?,
        };

        let search = match (
            var("AZURE_SEARCH_ENDPOINT"),
            var("AZURE_SEARCH_KEY"),
            var("AZURE_SEARCH_INDEX"),
        ) {
            (Some(endpoint), Some(key), Some(index)) => Some(SearchConfig {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_key: Secret::new(key),
                index,
                api_version: var("AZURE_SEARCH_API_VERSION")
                    .unwrap_or_else(|| "2023-11-01".to_string()),
            }),
            _ => None,
        };

        let container = var("AZURE_STORAGE_CONTAINER").unwrap_or_else(|| "uploads".to_string());
        let storage = if let Some(conn) = var("AZURE_STORAGE_CONNECTION_STRING") {
            let account = parse_connection_string(&conn)
                .context("AZURE_STORAGE_CONNECTION_STRING is malformed")?;
            Some(account.into_config(container))
        } else {
            match (var("AZURE_STORAGE_ACCOUNT"), var("AZURE_STORAGE_KEY")) {
                (Some(account), Some(key)) => {
                    validate_account_key(&key).context("AZURE_STORAGE_KEY is not valid base64")?;
                    Some(StorageConfig {
                        endpoint: format!("https://{}.blob.core.windows.net", account),
                        account,
                        account_key: Secret::new(key),
                        container,
                    })
                }
                _ => None,
            }
        };

        let agent = match (
            var("AZURE_AI_PROJECT_ENDPOINT"),
            var("AZURE_AI_AGENT_ID"),
            var("AZURE_AI_AGENT_TOKEN"),
        ) {
            (Some(endpoint), Some(agent_id), Some(token)) => Some(AgentConfig {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                agent_id,
                token: Secret::new(token),
                api_version: var("AZURE_AI_AGENTS_API_VERSION")
                    .unwrap_or_else(|| "2025-05-01".to_string()),
            }),
            _ => None,
        };

        let defaults = PollConfig::default();
        let poll = PollConfig {
            initial_interval_ms: parse_or(
                var("AGENT_POLL_INTERVAL_MS"),
                "AGENT_POLL_INTERVAL_MS",
                defaults.initial_interval_ms,
            )?,
            max_interval_ms: parse_or(
                var("AGENT_POLL_MAX_INTERVAL_MS"),
                "AGENT_POLL_MAX_INTERVAL_MS",
                defaults.max_interval_ms,
            )?,
            timeout_secs: parse_or(
                var("AGENT_RUN_TIMEOUT_SECS"),
                "AGENT_RUN_TIMEOUT_SECS",
                defaults.timeout_secs,
            )?,
        };

        let config = Config {
            server,
            model,
            search,
            storage,
            agent,
            poll,
            upstream_timeout_secs: parse_or(
                var("UPSTREAM_TIMEOUT_SECS"),
                "UPSTREAM_TIMEOUT_SECS",
                60,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll.initial_interval_ms == 0 {
            bail!("AGENT_POLL_INTERVAL_MS must be > 0");
        }
        if self.poll.max_interval_ms < self.poll.initial_interval_ms {
            bail!("AGENT_POLL_MAX_INTERVAL_MS must be >= AGENT_POLL_INTERVAL_MS");
        }
        if self.poll.timeout_secs == 0 {
            bail!("AGENT_RUN_TIMEOUT_SECS must be > 0");
        }
        if self.upstream_timeout_secs == 0 {
            bail!("UPSTREAM_TIMEOUT_SECS must be > 0");
        }
        if self.model.max_tokens == 0 {
            bail!("AZURE_OPENAI_MAX_TOKENS must be > 0");
        }
        if self.server.max_upload_bytes == 0 {
            bail!("MAX_UPLOAD_MB must be > 0");
        }
        Ok(())
    }

    /// Capability flags as reported by `GET /api/health` and `kbchat status`.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            endpoint: self.model.endpoint.is_some(),
            key: self.model.api_key.is_some(),
            blob: self.storage.is_some(),
            search: self.search.is_some(),
            agent: self.agent.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub endpoint: bool,
    pub key: bool,
    pub blob: bool,
    pub search: bool,
    pub agent: bool,
}

/// Print the capability table for `kbchat status`.
pub fn print_status(config: &Config) {
    let caps = config.capabilities();
    let row = |name: &str, ok: bool| {
        println!("  {:<24} {}", name, if ok { "configured" } else { "-" });
    };
    println!("kbchat {}", env!("CARGO_PKG_VERSION"));
    row("model endpoint", caps.endpoint);
    row("model key", caps.key);
    row("search", caps.search);
    row("blob storage", caps.blob);
    row("agent", caps.agent);
    if let Some(storage) = &config.storage {
        println!("  container: {} ({})", storage.container, storage.endpoint);
    }
    if let Some(search) = &config.search {
        println!("  index: {}", search.index);
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

fn validate_account_key(key: &str) -> Result<()> {
    BASE64.decode(key)?;
    Ok(())
}

/// Blob account fields extracted from a storage connection string.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageAccount {
    pub account: String,
    pub account_key: String,
    pub endpoint: String,
}

impl StorageAccount {
    fn into_config(self, container: String) -> StorageConfig {
        StorageConfig {
            account: self.account,
            account_key: Secret::new(self.account_key),
            endpoint: self.endpoint,
            container,
        }
    }
}

/// Parse an Azure storage connection string.
///
/// Recognizes `AccountName`, `AccountKey`, `BlobEndpoint`,
/// `DefaultEndpointsProtocol` and `EndpointSuffix`, plus the
/// `UseDevelopmentStorage=true` shorthand for Azurite.
pub fn parse_connection_string(conn: &str) -> Result<StorageAccount> {
    let mut account = None;
    let mut key = None;
    let mut blob_endpoint = None;
    let mut protocol = "https".to_string();
    let mut suffix = "core.windows.net".to_string();

    for part in conn.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        // Keys are base64 and may themselves contain '='.
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected Key=Value, got '{}'", part))?;
        match name {
            "AccountName" => account = Some(value.to_string()),
            "AccountKey" => key = Some(value.to_string()),
            "BlobEndpoint" => blob_endpoint = Some(value.trim_end_matches('/').to_string()),
            "DefaultEndpointsProtocol" => protocol = value.to_string(),
            "EndpointSuffix" => suffix = value.to_string(),
            "UseDevelopmentStorage" if value.eq_ignore_ascii_case("true") => {
                account.get_or_insert_with(|| DEV_STORAGE_ACCOUNT.to_string());
                key.get_or_insert_with(|| DEV_STORAGE_KEY.to_string());
                blob_endpoint.get_or_insert_with(|| DEV_STORAGE_ENDPOINT.to_string());
            }
            _ => {}
        }
    }

    let account = account.ok_or_else(|| anyhow::anyhow!("missing AccountName"))?;
    let account_key = key.ok_or_else(|| anyhow::anyhow!("missing AccountKey"))?;
    validate_account_key(&account_key).context("AccountKey is not valid base64")?;

    let endpoint =
        blob_endpoint.unwrap_or_else(|| format!("{}://{}.blob.{}", protocol, account, suffix));

    Ok(StorageAccount {
        account,
        account_key,
        endpoint,
    })
}
