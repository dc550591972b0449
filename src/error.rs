//! Error types for the Doxie MCP server.

use thiserror::Error;

use crate::mcp::codec::DecodeError;
use crate::mcp::protocol::ErrorKind;

/// Result type alias for Doxie operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Doxie MCP server.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Protocol Errors =====
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Handler error ({code}): {message}")]
    Handler { code: i64, message: String },

    #[error("Method already registered: {0}")]
    DuplicateMethod(String),

    // ===== Transport Errors =====
    #[error("Send error: {0}")]
    Send(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Search index error: {0}")]
    Index(#[from] rusqlite::Error),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled: operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Create a handler error with an opaque code.
    pub fn handler(code: i64, message: impl Into<String>) -> Self {
        Self::Handler {
            code,
            message: message.into(),
        }
    }

    /// The protocol error kind reported to a peer for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(e) => e.kind.into(),
            Self::MethodNotFound(_) => ErrorKind::MethodNotFound,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Handler { .. } => ErrorKind::HandlerError,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this error ends the session it occurred on.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::Send(_) | Self::Transport(_) | Self::Io(_))
    }
}
