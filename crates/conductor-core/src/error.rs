//! Core error type for the Conductor engine.
//!
//! `ConductorError` is raised for API misuse (unknown ids, duplicate
//! registrations, malformed definitions). Runtime execution outcomes such as
//! handler failures and timeouts are captured into result records instead and
//! only use the `Handler`/`Timeout`/`Cancelled` variants when a caller asks
//! for them explicitly.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConductorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// Short machine-readable tag, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Handler(_) => "handler",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Database(_) => "database",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for ConductorError {
    fn from(e: rusqlite::Error) -> Self {
        ConductorError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(e: serde_json::Error) -> Self {
        ConductorError::Internal(format!("Serialization failed: {}", e))
    }
}

/// Error returned by an agent's command handler.
///
/// Never propagated past the agent: it is folded into a failed
/// `AgentExecutionResult` carrying the message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
