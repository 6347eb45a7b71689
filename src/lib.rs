//! # kbchat
//!
//! A small HTTP backend for knowledge-base augmented chat on Azure.
//!
//! kbchat proxies chat completions to an Azure OpenAI deployment, optionally
//! injecting context retrieved from an Azure AI Search index, stores and
//! serves files in Azure Blob Storage, and runs prompts against a hosted
//! Azure AI agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌────────────────────┐
//! │  HTTP / CLI  │──▶│  Orchestrators   │──▶│  Adapter traits    │
//! │ server, main │   │ chat agent blobs │   │ Model Search Blob  │
//! └──────────────┘   └──────────────────┘   │ Agent              │
//!                                           └─────────┬──────────┘
//!                                                     ▼
//!                                         Azure REST (reqwest)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export AZURE_OPENAI_ENDPOINT=https://…/chat/completions?api-version=…
//! export AZURE_OPENAI_API_KEY=…
//! kbchat status                 # which capabilities are configured
//! kbchat chat "what is our on-call policy?"
//! kbchat serve --port 3000      # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment configuration |
//! | [`models`] | Core data types |
//! | [`error`] | Adapter error type |
//! | [`traits`] | Adapter traits and the [`traits::Services`] bundle |
//! | [`azure_openai`] | Chat completions adapter |
//! | [`azure_search`] | AI Search adapter |
//! | [`azure_blob`] | Blob Storage adapter (Shared Key) |
//! | [`azure_agents`] | AI Agents adapter |
//! | [`retrieval`] | Context retrieval and rendering |
//! | [`chat`] | Chat orchestration |
//! | [`agent`] | Agent run orchestration |
//! | [`blobs`] | Upload naming and listing |
//! | [`server`] | HTTP server |
//! | [`logging`] | Tracing subscriber setup |

pub mod agent;
pub mod azure_agents;
pub mod azure_blob;
pub mod azure_openai;
pub mod azure_search;
pub mod blobs;
pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod retrieval;
pub mod server;
pub mod traits;
