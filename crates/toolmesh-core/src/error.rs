//! Error types for toolmesh.
//!
//! Library crates keep their own structured errors and convert into this
//! workspace-level type at crate boundaries.

use thiserror::Error;

/// Result type alias using the toolmesh [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for toolmesh.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// MCP error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// A tool call could not be completed
    #[error("Tool error: {0}")]
    Tool(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/toolmesh/config.toml"),
            Error::Mcp(_) => Some("Check that the plugin endpoint is reachable and speaks MCP"),
            Error::NotFound(_) => Some("Use 'toolmesh plugins' to see configured plugins"),
            Error::Validation(_) => Some("Run 'toolmesh config validate' for details"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
