// Error types for the invocation runtime

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur inside the invocation runtime.
///
/// This layer guarantees state consistency under failure; it does not
/// mask failures. Retries belong to the model/network clients outside
/// this crate.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A consistency invariant was violated (e.g. an app/user state row
    /// missing at commit time, or an unknown tool with no fallback).
    /// Fatal, never retried here.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A backend transaction failed to commit. The store has already
    /// rolled back; the caller decides whether to retry.
    #[error("commit failed: {0}")]
    Commit(String),

    /// A tool body raised and no on-error interceptor supplied a
    /// fallback response. Fatal for the turn.
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// Malformed input (e.g. an auth config that does not deserialize).
    #[error("validation error: {0}")]
    Validation(String),

    /// A session with the same id already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Create an integrity violation error
    pub fn integrity(msg: impl Into<String>) -> Self {
        RuntimeError::Integrity(msg.into())
    }

    /// Create a commit failure error
    pub fn commit(msg: impl Into<String>) -> Self {
        RuntimeError::Commit(msg.into())
    }

    /// Create a tool execution error
    pub fn tool(msg: impl Into<String>) -> Self {
        RuntimeError::ToolExecution(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        RuntimeError::Validation(msg.into())
    }

    /// Create an already-exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        RuntimeError::AlreadyExists(msg.into())
    }
}
