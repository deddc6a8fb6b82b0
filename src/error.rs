//! Error types for raq-core.

use thiserror::Error;

/// Result type alias using raq-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during kernel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// RAG retrieval contract error
    #[error("Retrieval contract error: {endpoint} - {message}")]
    Contract { endpoint: String, message: String },

    /// Timeout during an operation
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// LLM API error
    #[error("LLM API error: {0}")]
    Llm(String),

    /// Profile loading or validation error
    #[error("Profile error: {0}")]
    Profile(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Tool execution failure
    #[error("Tool error: {tool} - {message}")]
    Tool { tool: String, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a contract error for a specific endpoint.
    pub fn contract(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Contract {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create a tool error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}
