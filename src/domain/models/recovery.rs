//! Recovery domain models: failure taxonomy, recovery decisions and
//! escalation reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::{ErrorEntry, ExecutionId, ExecutionRecord};

/// How a terminal failure of a phase should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; retrying the same phase may succeed
    Retriable,
    /// The work is wrong but can be corrected with feedback
    Fixable,
    /// Needs a human
    Fatal,
    /// No known signature matched
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retriable => "retriable",
            Self::Fixable => "fixable",
            Self::Fatal => "fatal",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the daemon does next with a failed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Run the same phase again
    Retry,
    /// Run the phase again with the failure fed back into the prompt
    Simplify { feedback: String },
    /// Stop and hand the execution to a human
    Escalate,
}

/// Action a human is offered in an escalation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Reset the task to pending after fixing the cause by hand
    ResetTask,
    /// Discard the workspace changes back to the base commit
    Rollback,
    /// Inspect and keep the provisional save-point
    InspectProvisional { reference: String },
    /// Narrow the task description or split it
    SplitTask,
    /// Fix the environment (tooling, ports, credentials)
    FixEnvironment { hint: String },
}

impl SuggestedAction {
    pub fn display_text(&self) -> String {
        match self {
            Self::ResetTask => "Fix the cause, then `drover task reset` the task".to_string(),
            Self::Rollback => "Discard the work with `drover exec rollback`".to_string(),
            Self::InspectProvisional { reference } => {
                format!("Inspect the provisional save-point {reference}")
            }
            Self::SplitTask => "Split the task into smaller board entries".to_string(),
            Self::FixEnvironment { hint } => format!("Fix the environment: {hint}"),
        }
    }
}

/// Structured account of an execution that could not finish on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationReport {
    pub id: String,
    pub execution_id: ExecutionId,
    pub task: String,
    pub group: String,
    pub summary: String,
    pub failure_kind: FailureKind,
    pub phase: Option<String>,
    pub errors: Vec<ErrorEntry>,
    pub retry_rounds: u32,
    pub fix_attempts: u32,
    pub relevant_files: Vec<String>,
    pub base_commit: Option<String>,
    pub provisional_ref: Option<String>,
    pub workspace_path: Option<String>,
    pub suggested_actions: Vec<SuggestedAction>,
    pub created_at: DateTime<Utc>,
}

impl EscalationReport {
    pub fn from_record(
        record: &ExecutionRecord,
        failure_kind: FailureKind,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("esc-{}", record.execution_id),
            execution_id: record.execution_id.clone(),
            task: record.task.clone(),
            group: record.group.clone(),
            summary: summary.into(),
            failure_kind,
            phase: record
                .current_phase
                .clone()
                .or_else(|| record.last_error().map(|e| e.phase.clone())),
            errors: record.errors.clone(),
            retry_rounds: record.retry_rounds,
            fix_attempts: record.fix_attempts,
            relevant_files: record.files_touched.clone(),
            base_commit: record.base_commit.clone(),
            provisional_ref: record.provisional_ref.clone(),
            workspace_path: record.workspace_path.clone(),
            suggested_actions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: SuggestedAction) -> Self {
        if !self.suggested_actions.contains(&action) {
            self.suggested_actions.push(action);
        }
        self
    }

    pub fn to_message(&self) -> String {
        let actions = if self.suggested_actions.is_empty() {
            "  none".to_string()
        } else {
            self.suggested_actions
                .iter()
                .enumerate()
                .map(|(i, a)| format!("  {}. {}", i + 1, a.display_text()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let last_error = self
            .errors
            .last()
            .map_or_else(|| "none".to_string(), |e| format!("[{}] {}", e.phase, e.message));

        format!(
            "Execution {} needs attention\nTask: {} (group {})\nKind: {}\nSummary: {}\nLast error: {}\nSuggested actions:\n{}",
            self.execution_id,
            self.task,
            self.group,
            self.failure_kind,
            self.summary,
            last_error,
            actions
        )
    }
}
