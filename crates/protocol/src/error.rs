//! Error types for the protocol crate.

use thiserror::Error;

/// JSON-RPC error code the server uses for rejected credentials.
pub const UNAUTHORIZED_CODE: i64 = 401;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Session errors
    /// The server rejected the credentials of the active profile.
    #[error("not logged in: {0}")]
    Authentication(String),

    /// A call was attempted while the connection is not open.
    #[error("not connected to the server")]
    NotConnected,

    /// The server answered a request with a JSON-RPC error.
    #[error("server error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the server.
        message: String,
    },

    /// The server reported `success: false` for a command.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// No credential profile is active.
    #[error("no active credential profile")]
    NoActiveProfile,

    /// A version string could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// The server sent something outside the fixed vocabulary.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An `instruction` notification this client does not understand.
    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Maps a JSON-RPC error object onto the taxonomy.
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == UNAUTHORIZED_CODE {
            ProtocolError::Authentication(message)
        } else {
            ProtocolError::Rpc { code, message }
        }
    }

    /// Returns true for failures caused by the transport rather than the server.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotConnected
                | ProtocolError::ConnectionClosed(_)
                | ProtocolError::Timeout(_)
        )
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            _ => ProtocolError::ConnectionClosed(err.to_string()),
        }
    }
}
