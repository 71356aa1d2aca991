//! Error types for the relay core.

use std::time::Duration;

use thiserror::Error;

use super::coordinator::CallId;
use super::registry::{ToolFailureKind, ToolResult};

/// Errors that can occur while relaying a realtime session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Connection to the upstream endpoint failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication against the upstream endpoint failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// A frame violated the realtime protocol (non-text frame, missing type tag, ...)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The peer went away
    #[error("Not connected")]
    NotConnected,
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Failures on the tool execution path. None of these end the session: each
/// is reported back into the conversation as a structured tool result.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("No pending function call with id '{0}'")]
    UnknownCall(CallId),

    #[error("No tool named '{0}' is registered")]
    UnknownTool(String),

    #[error("Arguments are not valid JSON: {0}")]
    InvalidArguments(#[source] serde_json::Error),

    #[error("Tool '{tool}' failed: {source:#}")]
    HandlerFailed {
        tool: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Tool '{tool}' did not finish within {}s", limit.as_secs_f64())]
    Timeout { tool: String, limit: Duration },
}

impl ToolError {
    pub fn kind(&self) -> ToolFailureKind {
        match self {
            Self::UnknownCall(_) => ToolFailureKind::UnknownCall,
            Self::UnknownTool(_) => ToolFailureKind::UnknownTool,
            Self::InvalidArguments(_) => ToolFailureKind::InvalidArguments,
            Self::HandlerFailed { .. } => ToolFailureKind::HandlerFailed,
            Self::Timeout { .. } => ToolFailureKind::Timeout,
        }
    }

    /// Structured failure result carrying this error.
    pub fn to_result(&self) -> ToolResult {
        ToolResult::failure(self.kind(), self.to_string())
    }
}
