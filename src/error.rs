//! Error types for the audit engine

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors produced by the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// I/O failure while reading source trees or writing reports
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Move source or Move.toml could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// LLM API call failed (network, auth, bad response shape)
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// Rate-limit retries exhausted
    #[error("Rate limit exceeded after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },

    /// A tool call failed inside the toolkit dispatch
    #[error("Tool call error: {0}")]
    ToolCall(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// The audit was cancelled cooperatively
    #[error("Audit cancelled")]
    Cancelled,

    /// A phase failed in a way that halts the pipeline
    #[error("Phase {phase} failed: {message}")]
    Phase { phase: u8, message: String },

    /// JSON serialization/deserialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl AuditError {
    /// Create an LLM API error
    pub fn llm_api(msg: impl Into<String>) -> Self {
        AuditError::LlmApi(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        AuditError::Parse(msg.into())
    }

    /// Create a tool-call error
    pub fn tool_call(msg: impl Into<String>) -> Self {
        AuditError::ToolCall(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        AuditError::Config(msg.into())
    }

    /// Create a phase error
    pub fn phase(phase: u8, msg: impl Into<String>) -> Self {
        AuditError::Phase {
            phase,
            message: msg.into(),
        }
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        AuditError::Other(msg.into())
    }

    /// True when the error represents cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AuditError::Cancelled)
    }
}
