//! Task domain model.
//!
//! Tasks are the lines of the task board. They are grouped into ordered
//! lanes where position, not explicit ids, determines dependency order.

use serde::{Deserialize, Serialize};

use super::execution::ExecutionId;
use crate::domain::errors::{DomainError, DomainResult};

/// Status of a task on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to run regardless of its neighbours
    Pending,
    /// Waits for every earlier task in its group to be done
    Blocked,
    /// Owned by a live execution
    InProgress,
    /// Completed with a result reference
    Done,
    /// Failed with a reason; needs an explicit reset to run again
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "blocked" => Some(Self::Blocked),
            "in_progress" | "in-progress" | "running" => Some(Self::InProgress),
            "done" | "complete" | "completed" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Board marker character between the brackets of a task line.
    pub fn marker(&self) -> char {
        match self {
            Self::Pending => ' ',
            Self::Blocked => '-',
            Self::InProgress => '~',
            Self::Done => 'x',
            Self::Failed => '!',
        }
    }

    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            ' ' => Some(Self::Pending),
            '-' => Some(Self::Blocked),
            '~' => Some(Self::InProgress),
            'x' | 'X' => Some(Self::Done),
            '!' => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the daemon still has something to do with a task in this state.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Blocked | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority hint carried in a task's tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A single tag from the `{...}` block of a task line.
///
/// Unknown tags are kept verbatim so a rewritten line keeps them, but
/// nothing in the scheduler reads them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTag {
    Model(String),
    Priority(TaskPriority),
    Workspace(String),
    Other(String),
}

impl TaskTag {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let Some((key, value)) = raw.split_once(':') else {
            return Self::Other(raw.to_string());
        };
        let value = value.trim();
        match key.trim().to_lowercase().as_str() {
            "model" if !value.is_empty() => Self::Model(value.to_string()),
            "priority" => TaskPriority::from_str(value)
                .map_or_else(|| Self::Other(raw.to_string()), Self::Priority),
            "workspace" if !value.is_empty() => Self::Workspace(value.to_string()),
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Model(model) => format!("model:{model}"),
            Self::Priority(priority) => format!("priority:{}", priority.as_str()),
            Self::Workspace(name) => format!("workspace:{name}"),
            Self::Other(raw) => raw.clone(),
        }
    }
}

/// One unit of work on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Natural key within the board
    pub description: String,
    pub status: TaskStatus,
    /// Assigned when the task is dispatched
    pub execution_id: Option<ExecutionId>,
    /// Commit or checkpoint reference of a finished task
    pub result_ref: Option<String>,
    /// Human-readable failure reason
    pub error: Option<String>,
    pub tags: Vec<TaskTag>,
    /// Index within the owning group
    pub position: usize,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: TaskStatus::Pending,
            execution_id: None,
            result_ref: None,
            error: None,
            tags: Vec::new(),
            position: 0,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tag(mut self, tag: TaskTag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn key(&self) -> &str {
        &self.description
    }

    pub fn model_hint(&self) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag {
            TaskTag::Model(model) => Some(model.as_str()),
            _ => None,
        })
    }

    pub fn priority(&self) -> TaskPriority {
        self.tags
            .iter()
            .find_map(|tag| match tag {
                TaskTag::Priority(priority) => Some(*priority),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn workspace_override(&self) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag {
            TaskTag::Workspace(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Decide what a requested transition does to this task.
    ///
    /// Missing metadata is an error; an incompatible current state is a
    /// [`TransitionCheck::Reject`].
    pub fn check_transition(
        &self,
        to: TaskStatus,
        meta: &TransitionMeta,
    ) -> DomainResult<TransitionCheck> {
        let invalid = |reason: &str| DomainError::InvalidTransition {
            task: self.description.clone(),
            to: to.to_string(),
            reason: reason.to_string(),
        };
        let same_id = |id: &ExecutionId| self.execution_id.as_ref() == Some(id);

        let check = match to {
            TaskStatus::InProgress => {
                let id = meta
                    .execution_id
                    .as_ref()
                    .ok_or_else(|| invalid("an execution id is required"))?;
                match self.status {
                    TaskStatus::Pending | TaskStatus::Blocked => TransitionCheck::Apply,
                    TaskStatus::InProgress if same_id(id) => TransitionCheck::NoOp,
                    _ => TransitionCheck::Reject,
                }
            }
            TaskStatus::Done => {
                let id = meta
                    .execution_id
                    .as_ref()
                    .ok_or_else(|| invalid("an execution id is required"))?;
                if meta.result_ref.as_deref().map_or(true, str::is_empty) {
                    return Err(invalid("a result reference is required"));
                }
                match self.status {
                    TaskStatus::InProgress if same_id(id) => TransitionCheck::Apply,
                    TaskStatus::Done if same_id(id) => TransitionCheck::NoOp,
                    _ => TransitionCheck::Reject,
                }
            }
            TaskStatus::Failed => {
                let reason = meta
                    .reason
                    .as_deref()
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| invalid("a failure reason is required"))?;
                let owner_matches = meta.execution_id.as_ref().map_or(true, same_id);
                match self.status {
                    TaskStatus::InProgress if owner_matches => TransitionCheck::Apply,
                    TaskStatus::Failed if owner_matches => {
                        if self.error.as_deref() == Some(reason) {
                            TransitionCheck::NoOp
                        } else {
                            TransitionCheck::Apply
                        }
                    }
                    _ => TransitionCheck::Reject,
                }
            }
            TaskStatus::Pending => match self.status {
                TaskStatus::Blocked | TaskStatus::Failed => TransitionCheck::Apply,
                TaskStatus::Pending => TransitionCheck::NoOp,
                _ => TransitionCheck::Reject,
            },
            TaskStatus::Blocked => match self.status {
                TaskStatus::Pending => TransitionCheck::Apply,
                TaskStatus::Blocked => TransitionCheck::NoOp,
                _ => TransitionCheck::Reject,
            },
        };
        Ok(check)
    }

    /// Apply a transition already accepted by [`Task::check_transition`].
    pub fn apply_transition(&mut self, to: TaskStatus, meta: &TransitionMeta) {
        self.status = to;
        match to {
            TaskStatus::InProgress => {
                self.execution_id = meta.execution_id.clone();
                self.result_ref = None;
                self.error = None;
            }
            TaskStatus::Done => {
                self.execution_id = meta.execution_id.clone().or(self.execution_id.take());
                self.result_ref = meta.result_ref.clone();
                self.error = None;
            }
            TaskStatus::Failed => {
                if meta.execution_id.is_some() {
                    self.execution_id = meta.execution_id.clone();
                }
                self.result_ref = None;
                self.error = meta.reason.as_ref().map(|r| sanitize_reason(r));
            }
            TaskStatus::Pending | TaskStatus::Blocked => {
                self.execution_id = None;
                self.result_ref = None;
                self.error = None;
            }
        }
    }
}

/// Failure reasons live on a single board line, after the last ` // `.
fn sanitize_reason(reason: &str) -> String {
    reason
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
        .replace(" // ", " / ")
}

/// Outcome of checking a requested transition against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    /// Rewrite the line
    Apply,
    /// Already in the requested state with the same owner
    NoOp,
    /// Incompatible with the current state
    Reject,
}

/// Metadata that accompanies a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionMeta {
    pub execution_id: Option<ExecutionId>,
    pub result_ref: Option<String>,
    pub reason: Option<String>,
}

impl TransitionMeta {
    pub fn started(execution_id: ExecutionId) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Default::default()
        }
    }

    pub fn done(execution_id: ExecutionId, result_ref: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id),
            result_ref: Some(result_ref.into()),
            reason: None,
        }
    }

    pub fn failed(execution_id: Option<ExecutionId>, reason: impl Into<String>) -> Self {
        Self {
            execution_id,
            result_ref: None,
            reason: Some(reason.into()),
        }
    }

    pub fn reset() -> Self {
        Self::default()
    }
}

/// A named, ordered lane of tasks sharing one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub tasks: Vec<Task>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Append a task, fixing up its position.
    pub fn push(&mut self, mut task: Task) {
        task.position = self.tasks.len();
        self.tasks.push(task);
    }

    /// Default workspace name shared by the tasks of this group.
    pub fn workspace_name(&self) -> String {
        slugify(&self.name)
    }

    pub fn find(&self, key: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.description == key)
    }
}

/// Turn a group or workspace name into a branch- and path-safe slug.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '.').to_string();
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ExecutionId {
        ExecutionId::parse(s).unwrap()
    }

    #[test]
    fn test_marker_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Blocked,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_marker(status.marker()), Some(status));
        }
        assert_eq!(TaskStatus::from_marker('X'), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::from_marker('?'), None);
    }

    #[test]
    fn test_tag_parsing() {
        assert_eq!(TaskTag::parse("model:opus"), TaskTag::Model("opus".to_string()));
        assert_eq!(
            TaskTag::parse(" priority: HIGH "),
            TaskTag::Priority(TaskPriority::High)
        );
        assert_eq!(
            TaskTag::parse("workspace:api"),
            TaskTag::Workspace("api".to_string())
        );
        assert_eq!(
            TaskTag::parse("priority:urgent"),
            TaskTag::Other("priority:urgent".to_string())
        );
        assert_eq!(TaskTag::parse("flaky"), TaskTag::Other("flaky".to_string()));
    }

    #[test]
    fn test_tag_accessors() {
        let task = Task::new("build")
            .with_tag(TaskTag::Other("flaky".to_string()))
            .with_tag(TaskTag::Model("haiku".to_string()))
            .with_tag(TaskTag::Workspace("shared".to_string()));
        assert_eq!(task.model_hint(), Some("haiku"));
        assert_eq!(task.workspace_override(), Some("shared"));
        assert_eq!(task.priority(), TaskPriority::Normal);
    }

    #[test]
    fn test_in_progress_requires_execution_id() {
        let task = Task::new("build");
        let err = task
            .check_transition(TaskStatus::InProgress, &TransitionMeta::default())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn test_done_requires_result_ref() {
        let task = Task::new("build").with_status(TaskStatus::InProgress);
        let meta = TransitionMeta {
            execution_id: Some(id("a1b2c3d4")),
            result_ref: None,
            reason: None,
        };
        assert!(task.check_transition(TaskStatus::Done, &meta).is_err());
    }

    #[test]
    fn test_failed_requires_reason() {
        let task = Task::new("build").with_status(TaskStatus::InProgress);
        let meta = TransitionMeta::failed(None, "   ");
        assert!(task.check_transition(TaskStatus::Failed, &meta).is_err());
    }

    #[test]
    fn test_second_execution_id_is_rejected() {
        let mut task = Task::new("build");
        let first = TransitionMeta::started(id("aaaaaaaa"));
        assert_eq!(
            task.check_transition(TaskStatus::InProgress, &first).unwrap(),
            TransitionCheck::Apply
        );
        task.apply_transition(TaskStatus::InProgress, &first);

        let again = task.check_transition(TaskStatus::InProgress, &first).unwrap();
        assert_eq!(again, TransitionCheck::NoOp);

        let second = TransitionMeta::started(id("bbbbbbbb"));
        assert_eq!(
            task.check_transition(TaskStatus::InProgress, &second).unwrap(),
            TransitionCheck::Reject
        );
    }

    #[test]
    fn test_done_is_terminal() {
        let mut task = Task::new("build");
        task.apply_transition(TaskStatus::InProgress, &TransitionMeta::started(id("aaaaaaaa")));
        let done = TransitionMeta::done(id("aaaaaaaa"), "9f3e2c1");
        task.apply_transition(TaskStatus::Done, &done);

        assert_eq!(task.result_ref.as_deref(), Some("9f3e2c1"));
        assert_eq!(
            task.check_transition(TaskStatus::Done, &done).unwrap(),
            TransitionCheck::NoOp
        );
        assert_eq!(
            task.check_transition(TaskStatus::Pending, &TransitionMeta::reset())
                .unwrap(),
            TransitionCheck::Reject
        );
        assert_eq!(
            task.check_transition(TaskStatus::Failed, &TransitionMeta::failed(None, "x"))
                .unwrap(),
            TransitionCheck::Reject
        );
    }

    #[test]
    fn test_failed_reset_clears_metadata() {
        let mut task = Task::new("build");
        task.apply_transition(TaskStatus::InProgress, &TransitionMeta::started(id("aaaaaaaa")));
        task.apply_transition(
            TaskStatus::Failed,
            &TransitionMeta::failed(None, "tests failed\nsee log"),
        );
        assert_eq!(task.error.as_deref(), Some("tests failed | see log"));
        assert_eq!(task.execution_id, Some(id("aaaaaaaa")));

        assert_eq!(
            task.check_transition(TaskStatus::Pending, &TransitionMeta::reset())
                .unwrap(),
            TransitionCheck::Apply
        );
        task.apply_transition(TaskStatus::Pending, &TransitionMeta::reset());
        assert!(task.execution_id.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_failed_with_foreign_owner_rejected() {
        let mut task = Task::new("build");
        task.apply_transition(TaskStatus::InProgress, &TransitionMeta::started(id("aaaaaaaa")));
        let foreign = TransitionMeta::failed(Some(id("bbbbbbbb")), "boom");
        assert_eq!(
            task.check_transition(TaskStatus::Failed, &foreign).unwrap(),
            TransitionCheck::Reject
        );
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Group A"), "group-a");
        assert_eq!(slugify("  api/v2 -- auth "), "api-v2-auth");
        assert_eq!(slugify("***"), "default");
        assert_eq!(slugify("release_1.2"), "release_1.2");
    }
}
