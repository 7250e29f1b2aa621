//! MCP-specific error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP request itself failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// The server no longer knows our session id.
    #[error("session expired on server")]
    SessionExpired,

    /// Connection was closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// The SSE stream never announced its message endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A configured header could not be encoded.
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
}

impl TransportError {
    /// Whether this error means the underlying connection is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::NotConnected | Self::SessionExpired => true,
            Self::Request(e) => e.is_connect() || e.is_request() && !e.is_timeout(),
            Self::HttpStatus { status, .. } => *status == 404 || *status == 410,
            _ => false,
        }
    }
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level error (malformed messages, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server returned an error response.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i32, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection is not in the correct state.
    #[error("invalid connection state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Opening the transport or the handshake failed.
    #[error("failed to connect plugin '{plugin}': {message}")]
    Connection { plugin: String, message: String },

    /// No live session for the key.
    #[error("no session for plugin '{plugin}' of tenant '{tenant}'")]
    SessionNotFound { tenant: String, plugin: String },

    /// A tool call exceeded its deadline.
    #[error("tool '{tool}' timed out after {timeout:?}")]
    CallTimeout { tool: String, timeout: Duration },

    /// The connection kept dropping until the reconnect budget ran out.
    #[error("tool '{tool}' failed after {attempts} attempts: connection closed ({message})")]
    TransportClosed {
        tool: String,
        attempts: u32,
        message: String,
    },

    /// The remote answered with something we could not interpret.
    #[error("tool '{tool}' returned a malformed response: {message}")]
    ProtocolFormat { tool: String, message: String },

    /// Any other tool failure.
    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// A combined tool name could not be split into plugin and tool.
    #[error("invalid tool name '{0}': expected 'plugin_tool' or 'plugin.tool'")]
    InvalidToolName(String),
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a server error from JSON-RPC error.
    pub fn server_error(code: i32, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn connection(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn session_not_found(tenant: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self::SessionNotFound {
            tenant: tenant.into(),
            plugin: plugin.into(),
        }
    }

    /// Whether the error means the session is gone and a reconnect may help.
    pub fn is_reconnectable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_disconnect(),
            Self::SessionNotFound { .. } => true,
            // A closed connection refuses further requests.
            Self::InvalidState { actual, .. } => actual == "disconnected" || actual == "closing",
            _ => false,
        }
    }

    /// Whether the remote sent something we could not decode.
    pub fn is_protocol_format(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Json(_))
    }

    /// Wrap a low-level error with the fully-qualified tool name.
    pub fn for_tool(self, tool: &str) -> Self {
        match self {
            e @ (Self::CallTimeout { .. }
            | Self::TransportClosed { .. }
            | Self::ProtocolFormat { .. }
            | Self::Tool { .. }
            | Self::SessionNotFound { .. }) => e,
            e if e.is_protocol_format() => Self::ProtocolFormat {
                tool: tool.to_string(),
                message: e.to_string(),
            },
            e => Self::Tool {
                tool: tool.to_string(),
                message: e.to_string(),
            },
        }
    }
}

impl From<McpError> for toolmesh_core::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::SessionNotFound { .. } => toolmesh_core::Error::NotFound(e.to_string()),
            McpError::InvalidToolName(_) => toolmesh_core::Error::Validation(e.to_string()),
            McpError::CallTimeout { .. }
            | McpError::TransportClosed { .. }
            | McpError::ProtocolFormat { .. }
            | McpError::Tool { .. } => toolmesh_core::Error::Tool(e.to_string()),
            _ => toolmesh_core::Error::Mcp(e.to_string()),
        }
    }
}
