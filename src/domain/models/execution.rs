//! Execution domain model.
//!
//! An execution is one dispatch of one task into an isolated workspace. Its
//! record survives daemon restarts and is the source of truth for resume,
//! rollback and escalation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of a generated execution id.
pub const EXECUTION_ID_LEN: usize = 8;

/// Short opaque identifier of one dispatch of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Draw a fresh id from a v4 UUID.
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..EXECUTION_ID_LEN].to_string())
    }

    /// Accept an id read from the board or the command line.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pair of ports reserved for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub primary: u16,
    pub secondary: u16,
}

/// Lifecycle of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    /// Handed to a human through an escalation report
    Escalated,
    /// Workspace reset to the base commit by an operator
    RolledBack,
    Cancelled,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "escalated" => Some(Self::Escalated),
            "rolled_back" | "rolledback" => Some(Self::RolledBack),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error observed during an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub phase: String,
    pub message: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Persistent state of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    /// Board description of the task
    pub task: String,
    pub group: String,
    pub workspace_path: Option<String>,
    pub branch: Option<String>,
    /// Workspace HEAD when isolation was acquired
    pub base_commit: Option<String>,
    pub ports: Option<PortPair>,
    pub status: ExecutionStatus,
    pub current_phase: Option<String>,
    #[serde(default)]
    pub completed_phases: Vec<String>,
    pub last_commit: Option<String>,
    /// Save-point commit made when a failure left partial work behind
    pub provisional_ref: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    /// Worker invocations across all phases
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub fix_attempts: u32,
    #[serde(default)]
    pub retry_rounds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(
        execution_id: ExecutionId,
        task: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            task: task.into(),
            group: group.into(),
            workspace_path: None,
            branch: None,
            base_commit: None,
            ports: None,
            status: ExecutionStatus::Running,
            current_phase: None,
            completed_phases: Vec::new(),
            last_commit: None,
            provisional_ref: None,
            files_touched: Vec::new(),
            errors: Vec::new(),
            attempts: 0,
            fix_attempts: 0,
            retry_rounds: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn begin_phase(&mut self, phase: &str) {
        self.current_phase = Some(phase.to_string());
        self.touch();
    }

    /// Record a successfully finished phase.
    pub fn complete_phase(&mut self, phase: &str, commit: Option<String>, files: &[String]) {
        if !self.completed_phases.iter().any(|p| p == phase) {
            self.completed_phases.push(phase.to_string());
        }
        if commit.is_some() {
            self.last_commit = commit;
        }
        for file in files {
            if !self.files_touched.contains(file) {
                self.files_touched.push(file.clone());
            }
        }
        self.current_phase = None;
        self.touch();
    }

    pub fn record_error(&mut self, phase: &str, message: impl Into<String>, recoverable: bool) {
        self.errors.push(ErrorEntry {
            phase: phase.to_string(),
            message: message.into(),
            recoverable,
            timestamp: Utc::now(),
        });
        self.touch();
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.current_phase = None;
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Phases from `phases` that still need to run, in order.
    pub fn remaining_phases(&self, phases: &[String]) -> Vec<String> {
        phases
            .iter()
            .filter(|p| !self.completed_phases.contains(p))
            .cloned()
            .collect()
    }

    /// Reference that identifies the work a successful run produced.
    pub fn result_ref(&self) -> String {
        self.last_commit
            .clone()
            .unwrap_or_else(|| format!("exec-{}", self.execution_id))
    }

    pub fn last_error(&self) -> Option<&ErrorEntry> {
        self.errors.last()
    }
}

/// Immutable snapshot taken after a successful phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    pub sequence: u32,
    pub phase: String,
    pub commit: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    pub created_at: DateTime<Utc>,
}
