//! Board store port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Group, TaskStatus, TaskTag, TransitionMeta};

/// Atomic access to the task board.
///
/// Every mutation holds the board lock for its whole read-modify-write
/// cycle, so concurrent writers never interleave.
#[async_trait]
pub trait BoardStore: Send + Sync {
    /// Parse the current board.
    async fn read(&self) -> DomainResult<Vec<Group>>;

    /// Raw board text, for the cheap pending-work check.
    async fn read_text(&self) -> DomainResult<String>;

    /// Move the task identified by `task_key` to `status`.
    ///
    /// Returns `false` when the task's current state is incompatible with
    /// the request, `true` when the transition was applied or was already in
    /// effect.
    async fn transition(
        &self,
        task_key: &str,
        status: TaskStatus,
        meta: TransitionMeta,
    ) -> DomainResult<bool>;

    /// Append a task to the end of `group`, creating the group if needed.
    ///
    /// The task lands `Pending` when every earlier task of the group is done,
    /// `Blocked` otherwise.
    async fn append(&self, group: &str, description: &str, tags: &[TaskTag]) -> DomainResult<()>;
}
