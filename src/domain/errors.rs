//! Domain errors for the drover scheduler.

use thiserror::Error;

/// Domain-level errors that can occur in the drover system.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Execution record not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid transition for '{task}' to {to}: {reason}")]
    InvalidTransition {
        task: String,
        to: String,
        reason: String,
    },

    #[error("Board lock at {path} still held after {waited_ms}ms")]
    LockContention { path: String, waited_ms: u64 },

    #[error("Port pool exhausted: all {pool_size} port pairs are in use")]
    PortPoolExhausted { pool_size: u16 },

    #[error("Workspace '{workspace}' is already in use by execution {holder}")]
    WorkspaceBusy { workspace: String, holder: String },

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl DomainError {
    /// Whether this error can never be fixed by simply retrying.
    ///
    /// Isolation failures surface through this to the recovery subsystem.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PortPoolExhausted { .. }
                | Self::Config(_)
                | Self::Git(_)
                | Self::InvalidTransition { .. }
                | Self::ValidationFailed(_)
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
