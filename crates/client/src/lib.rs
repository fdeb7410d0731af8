//! # Ichibot Client Library
//!
//! Interactive session engine for an ichibot command server.
//!
//! ## Overview
//!
//! The client keeps a persistent WebSocket session with the server and
//! turns typed lines into JSON-RPC calls. It provides:
//!
//! - **Connection Management**: reconnect with backoff, heartbeat, cookies
//! - **RPC Session**: request/response correlation and server notifications
//! - **Credentials**: named exchange profiles kept in a key-value store
//! - **Init Scripts**: per-exchange command files replayed on every login
//! - **Shutdown Drain**: one `bye` per profile that logged in
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Client                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │  Dispatcher  │  │ Init Scripts │  │  Credential Store    │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                      RPC Session                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │           Connection Manager (WebSocket task)              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use client::{Client, Config, ConsoleOutput, InitFileStore, SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let data_dir = config.client.data_dir.clone();
//!
//!     let client = Client::new(
//!         &config,
//!         Arc::new(SqliteStore::open(data_dir.join("ichibot.db"))?),
//!         Arc::new(InitFileStore::new(&data_dir)),
//!         Arc::new(ConsoleOutput::new(false, false)),
//!     )?;
//!
//!     client.offer_input("login default");
//!     client.close_input();
//!     client.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`network`]: WebSocket connection lifecycle
//! - [`rpc`]: JSON-RPC correlation
//! - [`client`]: Session orchestration and the command loop
//! - [`dispatcher`]: Command parsing and init-script edits
//! - [`credentials`]: Stored profiles, cookies and the client id
//! - [`script`]: Init-script files
//! - [`storage`]: Key-value persistence
//! - [`output`]: User-facing output sinks
//! - [`logging`]: Diagnostics subscriber setup

pub mod client;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod drain;
pub mod logging;
pub mod mailbox;
pub mod network;
pub mod output;
pub mod rpc;
pub mod script;
pub mod storage;

// Re-export protocol for convenience
pub use protocol;

pub use client::{describe_error, Client, ClientSettings, ClientTasks, SessionContext};
pub use config::{Config, ConfigError};
pub use credentials::CredentialStore;
pub use dispatcher::{Command, CommandOutcome, ScriptEdit};
pub use mailbox::PromptMailbox;
pub use network::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionPhase, ConnectionSettings,
};
pub use output::{ConsoleOutput, MemoryOutput, OutputLevel, OutputSink};
pub use rpc::RpcSession;
pub use script::{InitFileStore, InitScript, ScriptStore};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageError};
