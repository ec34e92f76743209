//! Worker domain models.
//!
//! A worker is the external coding-agent process that performs one phase of
//! one task inside an isolated workspace.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::execution::ExecutionId;

/// Everything a worker needs for one invocation.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub execution_id: ExecutionId,
    pub phase: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Complete environment of the child; nothing else is inherited
    pub env: BTreeMap<String, String>,
    pub model: Option<String>,
    /// Cancelled when the attempt must stop (timeout, operator cancel, shutdown)
    pub cancel: CancellationToken,
}

impl WorkerInvocation {
    pub fn new(
        execution_id: ExecutionId,
        phase: impl Into<String>,
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            execution_id,
            phase: phase.into(),
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            model: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Structured progress event parsed from the worker's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Free-form assistant text or an unparseable output line
    Text { content: String },
    ToolUse { name: String },
    Phase { name: String, status: String },
    FileTouched { path: String },
    Commit { sha: String },
    Error { message: String },
    Result { text: String, is_error: bool },
    Usage { input_tokens: u64, output_tokens: u64 },
}

impl WorkerEvent {
    /// Error message carried by this event, if it reports a failure.
    pub fn reported_error(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            Self::Result { text, is_error: true } => Some(text),
            _ => None,
        }
    }
}

/// Raw result of a worker process that ran to exit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl WorkerExit {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors raised before or instead of a normal worker exit.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker binary not found: {0}")]
    NotFound(String),

    #[error("Invalid worker invocation: {0}")]
    InvalidInvocation(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker I/O failed: {0}")]
    Io(String),

    #[error("Worker cancelled")]
    Cancelled,
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Io(err.to_string())
    }
}

/// Classification of one worker attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Success,
    RetryableProcessError,
    RetryableTimeout,
    RetryableExecutionError,
    NonRetryable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableProcessError => "retryable_process_error",
            Self::RetryableTimeout => "retryable_timeout",
            Self::RetryableExecutionError => "retryable_execution_error",
            Self::NonRetryable => "non_retryable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetryableProcessError | Self::RetryableTimeout | Self::RetryableExecutionError
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one phase through the execution wrapper.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    /// Stdout of the last attempt
    pub output: String,
    pub error_class: ErrorClass,
    pub duration: Duration,
    pub attempts: u32,
    pub error: Option<String>,
    /// Events of the last attempt
    pub events: Vec<WorkerEvent>,
}

impl Outcome {
    /// Last commit the worker reported.
    pub fn last_commit(&self) -> Option<String> {
        self.events.iter().rev().find_map(|e| match e {
            WorkerEvent::Commit { sha } => Some(sha.clone()),
            _ => None,
        })
    }

    pub fn files_touched(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for event in &self.events {
            if let WorkerEvent::FileTouched { path } = event {
                if !files.contains(path) {
                    files.push(path.clone());
                }
            }
        }
        files
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_class == ErrorClass::NonRetryable && self.error.as_deref() == Some("cancelled")
    }
}
