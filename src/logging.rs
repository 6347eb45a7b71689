//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once at startup, before configuration is read, so that
//! configuration errors are logged through the same subscriber.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber.
///
/// `RUST_LOG` takes precedence; `default_level` is used when it is unset or
/// unparsable. Output goes to stderr so CLI commands keep stdout clean.
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid log level '{}': {}", default_level, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to set subscriber: {}", e))?;

    Ok(())
}
