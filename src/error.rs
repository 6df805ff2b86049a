//! Error types for the MCP engine.

use std::time::Duration;

use thiserror::Error;

use crate::mcp::protocol::error_codes;
use crate::mcp::session::SessionState;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the MCP engine.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Transport Errors =====
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Content-Type must be application/json, got: {0}")]
    UnsupportedContentType(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("End of stream")]
    EndOfStream,

    // ===== MCP Errors =====
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool panicked: {0}")]
    ToolPanicked(String),

    #[error("Failed to read resource: {0}")]
    ResourceReadFailed(String),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    // ===== Session Errors =====
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // ===== SSE Errors =====
    #[error("SSE client not found: {0}")]
    ClientNotFound(String),

    #[error("SSE client closed: {0}")]
    ClientClosed(String),

    #[error("Message queue full for client: {0}")]
    QueueFull(String),

    // ===== Sandbox Errors =====
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== HTTP Errors =====
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled: operation was cancelled")]
    Cancelled,
}

impl Error {
    /// JSON-RPC error code used when this error escapes a method handler.
    ///
    /// Handlers produce invalid-params, state or internal errors; the
    /// remaining codes belong to the dispatcher.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) | Self::InvalidToolArguments(_) => error_codes::INVALID_PARAMS,
            Self::InvalidTransition { .. } => error_codes::STATE_ERROR,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Whether the error is a transport-level failure that never reaches
    /// the dispatcher.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::MethodNotAllowed(_) | Self::UnsupportedContentType(_) | Self::Parse(_) | Self::EndOfStream
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let not_found = Error::ToolNotFound("unknown_tool".to_string());
        assert_eq!(not_found.to_string(), "Tool not found: unknown_tool");

        let resource = Error::ResourceNotFound("config://missing".to_string());
        assert_eq!(resource.to_string(), "Resource not found: config://missing");

        let content_type = Error::UnsupportedContentType("text/plain".to_string());
        assert!(content_type.to_string().contains("application/json"));
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(
            Error::InvalidParams("missing uri".to_string()).rpc_code(),
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            Error::InvalidToolArguments("a".to_string()).rpc_code(),
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            Error::ToolExecutionFailed("division by zero".to_string()).rpc_code(),
            error_codes::INTERNAL_ERROR
        );
        assert_eq!(Error::Cancelled.rpc_code(), error_codes::INTERNAL_ERROR);
        assert_eq!(
            Error::InvalidTransition {
                from: SessionState::Ready,
                to: SessionState::Initialized,
            }
            .rpc_code(),
            error_codes::STATE_ERROR
        );
        assert_eq!(
            Error::Timeout(Duration::from_secs(30)).rpc_code(),
            error_codes::INTERNAL_ERROR
        );
    }

    #[test]
    fn test_transition_error() {
        let err = Error::InvalidTransition {
            from: SessionState::New,
            to: SessionState::Ready,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from new to ready"
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::EndOfStream.is_transport());
        assert!(Error::MethodNotAllowed("GET".to_string()).is_transport());
        assert!(Error::Parse("eof".to_string()).is_transport());
        assert!(!Error::Cancelled.is_transport());
    }

    #[test]
    fn test_timeout_and_cancelled() {
        let timeout = Error::Timeout(Duration::from_secs(30));
        assert_eq!(
            timeout.to_string(),
            "Timeout: operation timed out after 30s"
        );

        let cancelled = Error::Cancelled;
        assert_eq!(cancelled.to_string(), "Cancelled: operation was cancelled");
    }
}
