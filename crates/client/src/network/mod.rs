//! Network module for the command-server connection.
//!
//! - [`connection`]: connection lifecycle, reconnects and the socket task
//! - [`heartbeat`]: silence detection for connections that look open
//! - [`backoff`]: reconnect delay schedule

pub mod backoff;
pub mod connection;
pub mod heartbeat;

pub use backoff::Backoff;
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionPhase, ConnectionSettings,
};
pub use heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
