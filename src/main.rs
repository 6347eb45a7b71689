//! # kbchat CLI
//!
//! The `kbchat` binary starts the HTTP server and exposes each capability
//! as a one-shot command for checking a deployment from the terminal.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbchat serve` | Start the HTTP server |
//! | `kbchat status` | Show which capabilities are configured |
//! | `kbchat search "<query>"` | Show what chat would retrieve for a query |
//! | `kbchat chat "<message>"` | Single-turn knowledge-base chat |
//! | `kbchat agent "<prompt>"` | Run a prompt on the hosted agent |
//! | `kbchat blobs` | List uploaded blobs |
//!
//! Configuration comes from the environment; a `.env` file in the working
//! directory is loaded first when present.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kbchat::{agent, blobs, chat, config, logging, retrieval, server};

/// kbchat: knowledge-base chat, blob storage and agent runs on Azure.
#[derive(Parser)]
#[command(
    name = "kbchat",
    about = "Knowledge-base augmented chat backend for Azure OpenAI",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Flags override `PORT`, `BIND_ADDR` and `STATIC_DIR`.
    Serve {
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        bind: Option<String>,

        #[arg(long)]
        static_dir: Option<PathBuf>,
    },

    /// Show which capabilities are configured. Never prints secrets.
    Status,

    /// Query the search index the way chat does and print the hits.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Send one user message through the chat pipeline.
    Chat { message: String },

    /// Run a prompt on the configured agent and print the transcript.
    Agent { prompt: String },

    /// List blobs in the upload container.
    Blobs {
        #[arg(long, default_value = "")]
        prefix: String,

        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    logging::init("info")?;

    let mut cfg = config::Config::from_env()?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            static_dir,
        } => {
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            if let Some(dir) = static_dir {
                cfg.server.static_dir = dir;
            }
            server::run_server(&cfg).await?;
        }
        Commands::Status => {
            config::print_status(&cfg);
        }
        Commands::Search { query, limit } => {
            retrieval::run_search(&cfg, &query, limit).await?;
        }
        Commands::Chat { message } => {
            chat::run_chat_command(&cfg, &message).await?;
        }
        Commands::Agent { prompt } => {
            agent::run_agent_command(&cfg, &prompt).await?;
        }
        Commands::Blobs { prefix, limit } => {
            blobs::run_list_command(&cfg, &prefix, limit).await?;
        }
    }

    Ok(())
}
