//! Error types for Switchboard gateway operations.

use rmcp::model::{ErrorCode, ErrorData};
use thiserror::Error;

/// Main error type for Switchboard operations
#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// Invalid configuration for a named backend
    #[error("invalid config for backend '{0}': {1}")]
    InvalidConfig(String, String),

    /// The configured transport kind is not one Switchboard knows how to build
    #[error("unsupported transport '{1}' for backend '{0}'")]
    UnsupportedTransport(String, String),

    /// Transport construction failed before any handshake was attempted
    #[error("transport error for backend '{0}': {1}")]
    Transport(String, String),

    /// Protocol handshake with a backend failed or timed out
    #[error("connection to backend '{0}' failed: {1}")]
    Connection(String, String),

    /// Backend does not implement the given method ("method not found")
    #[error("backend '{0}' does not support '{1}'")]
    MethodNotSupported(String, String),

    /// Capability discovery call failed for a reason other than "method not found"
    #[error("discovery failed for backend '{0}': {1}")]
    Discovery(String, String),

    /// Backend answered a forwarded request with a protocol error
    #[error("backend '{0}' returned an error: {msg}", msg = .1.message)]
    Backend(String, ErrorData),

    /// Forwarded request failed below the protocol layer
    #[error("protocol error for backend '{0}': {1}")]
    Protocol(String, String),

    /// No routable tool is exposed under this name
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// No backend owns a prompt with this name
    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),

    /// No backend owns a resource with this URI
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// Inbound session id is not registered
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Tearing down a backend connection failed
    #[error("cleanup failed for backend '{0}': {1}")]
    Cleanup(String, String),
}

impl SwitchboardError {
    /// Whether a failed connection attempt may be retried.
    ///
    /// Only handshake failures are retried; an unknown transport kind or a
    /// transport that cannot even be constructed will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwitchboardError::Connection(..))
    }
}

/// JSON-RPC error code used for unknown inbound session ids.
pub const SESSION_NOT_FOUND_CODE: ErrorCode = ErrorCode(-32001);

impl From<SwitchboardError> for ErrorData {
    fn from(err: SwitchboardError) -> Self {
        let message = err.to_string();
        match err {
            SwitchboardError::Backend(_, data) => data,
            SwitchboardError::UnknownTool(_) | SwitchboardError::UnknownPrompt(_) => {
                ErrorData::invalid_params(message, None)
            }
            SwitchboardError::UnknownResource(_) => ErrorData::resource_not_found(message, None),
            SwitchboardError::SessionNotFound(_) => {
                ErrorData::new(SESSION_NOT_FOUND_CODE, message, None)
            }
            _ => ErrorData::internal_error(message, None),
        }
    }
}

/// Result type alias for Switchboard operations
pub type Result<T> = std::result::Result<T, SwitchboardError>;
