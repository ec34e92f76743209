//! File-backed board store.
//!
//! Mutations lock `<board>.lock`, patch exactly one line of the board and
//! land through a synced temp file and a rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::adapters::fs_lock::{lock_path_for, write_atomic, FileLockGuard};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Group, Task, TaskStatus, TaskTag, TransitionCheck, TransitionMeta,
};
use crate::domain::ports::BoardStore;
use crate::services::task_graph::{
    self, classify_line, render_task_line, trim_line_ending, BoardLine, DEFAULT_GROUP,
};

/// Board store over a plain-text file.
#[derive(Debug, Clone)]
pub struct FileBoardStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl FileBoardStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_text_sync(&self) -> DomainResult<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn transition_sync(
        &self,
        task_key: &str,
        status: TaskStatus,
        meta: &TransitionMeta,
    ) -> DomainResult<bool> {
        let _guard = FileLockGuard::acquire(&self.lock_path, self.lock_timeout)?;
        let text = self.read_text_sync()?;
        let located = task_graph::locate(&text, task_key)
            .ok_or_else(|| DomainError::TaskNotFound(task_key.to_string()))?;

        let mut task = located.task;
        match task.check_transition(status, meta)? {
            TransitionCheck::Reject => {
                debug!(
                    task = task_key,
                    from = %task.status,
                    to = %status,
                    "transition rejected by current state"
                );
                Ok(false)
            }
            TransitionCheck::NoOp => Ok(true),
            TransitionCheck::Apply => {
                let from = task.status;
                task.apply_transition(status, meta);
                let patched = patch_line(&text, located.line_index, &render_task_line(&task));
                write_atomic(&self.path, patched.as_bytes())?;
                info!(
                    task = task_key,
                    group = %located.group,
                    from = %from,
                    to = %status,
                    execution_id = ?task.execution_id.as_ref().map(ToString::to_string),
                    "task transitioned"
                );
                Ok(true)
            }
        }
    }

    fn append_sync(&self, group: &str, description: &str, tags: &[TaskTag]) -> DomainResult<()> {
        let description = description.trim();
        if description.is_empty() || description.contains(['\n', '\r']) {
            return Err(DomainError::ValidationFailed(
                "task description must be a single non-empty line".to_string(),
            ));
        }
        let group = group.trim();
        if group.is_empty() {
            return Err(DomainError::ValidationFailed(
                "group name must not be empty".to_string(),
            ));
        }

        let _guard = FileLockGuard::acquire(&self.lock_path, self.lock_timeout)?;
        let text = self.read_text_sync()?;
        let located = task_graph::scan(&text);
        if located.iter().any(|l| l.task.description == description) {
            return Err(DomainError::ValidationFailed(format!(
                "a task named '{description}' already exists"
            )));
        }

        let siblings: Vec<_> = located.iter().filter(|l| l.group == group).collect();
        let status = if siblings.iter().all(|l| l.task.status == TaskStatus::Done) {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        let mut task = Task::new(description).with_status(status);
        task.tags = tags.to_vec();
        let line = render_task_line(&task);

        let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let insert_after = siblings
            .last()
            .map(|l| l.line_index)
            .or_else(|| header_line(&text, group));
        let updated = match insert_after {
            Some(index) => insert_line(&text, index, &line, newline),
            None => append_section(&text, group, &line, newline),
        };

        write_atomic(&self.path, updated.as_bytes())?;
        info!(task = description, group, status = %status, "task appended");
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> DomainResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> DomainResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(store))
            .await
            .map_err(|e| DomainError::Io(format!("board operation aborted: {e}")))?
    }
}

#[async_trait]
impl BoardStore for FileBoardStore {
    async fn read(&self) -> DomainResult<Vec<Group>> {
        let text = self.read_text().await?;
        Ok(task_graph::parse(&text))
    }

    async fn read_text(&self) -> DomainResult<String> {
        self.blocking(|store| store.read_text_sync()).await
    }

    #[instrument(skip(self, meta), fields(to = %status))]
    async fn transition(
        &self,
        task_key: &str,
        status: TaskStatus,
        meta: TransitionMeta,
    ) -> DomainResult<bool> {
        let key = task_key.to_string();
        self.blocking(move |store| store.transition_sync(&key, status, &meta))
            .await
    }

    #[instrument(skip(self, tags))]
    async fn append(&self, group: &str, description: &str, tags: &[TaskTag]) -> DomainResult<()> {
        let group = group.to_string();
        let description = description.to_string();
        let tags = tags.to_vec();
        self.blocking(move |store| store.append_sync(&group, &description, &tags))
            .await
    }
}

/// Replace line `index`, keeping its indentation, bullet and terminator.
fn patch_line(text: &str, index: usize, rendered: &str) -> String {
    let mut out = String::with_capacity(text.len() + 32);
    for (i, raw) in text.split_inclusive('\n').enumerate() {
        if i != index {
            out.push_str(raw);
            continue;
        }
        let body = trim_line_ending(raw);
        let ending = &raw[body.len()..];
        let indent_len = body.len() - body.trim_start().len();
        out.push_str(&body[..indent_len]);
        if body.trim_start().starts_with("* ") {
            out.push_str("* ");
            out.push_str(rendered.strip_prefix("- ").unwrap_or(rendered));
        } else {
            out.push_str(rendered);
        }
        out.push_str(ending);
    }
    out
}

fn header_line(text: &str, group: &str) -> Option<usize> {
    if group == DEFAULT_GROUP {
        return None;
    }
    text.split_inclusive('\n')
        .enumerate()
        .filter(|(_, raw)| {
            matches!(classify_line(trim_line_ending(raw)), BoardLine::Header(name) if name == group)
        })
        .map(|(i, _)| i)
        .last()
}

fn insert_line(text: &str, index: usize, line: &str, newline: &str) -> String {
    let mut out = String::with_capacity(text.len() + line.len() + 2);
    for (i, raw) in text.split_inclusive('\n').enumerate() {
        out.push_str(raw);
        if i == index {
            if !raw.ends_with('\n') {
                out.push_str(newline);
            }
            out.push_str(line);
            out.push_str(newline);
        }
    }
    out
}

fn append_section(text: &str, group: &str, line: &str, newline: &str) -> String {
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push_str(newline);
    }
    if !out.trim().is_empty() {
        out.push_str(newline);
    }
    out.push_str(&format!("## {group}{newline}{line}{newline}"));
    out
}
