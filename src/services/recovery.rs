//! Recovery subsystem.
//!
//! Decides what happens after a phase fails for good: retry, retry with the
//! failure fed back, or escalate to a human. Also owns checkpoints,
//! provisional save-points and operator rollback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::adapters::fs_lock::write_atomic;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Checkpoint, ErrorClass, EscalationReport, ExecutionId, ExecutionRecord, ExecutionStatus,
    FailureKind, Outcome, RecoveryAction, RecoveryConfig, SuggestedAction, TaskStatus,
    TransitionMeta,
};
use crate::domain::ports::{BoardStore, EscalationSink, ExecutionStore};
use crate::services::git;

/// Failure reason written to the board by an operator rollback.
pub const ROLLBACK_REASON: &str = "rolled back by operator";

const FATAL_SIGNATURES: &[&str] = &[
    "permission denied",
    "authentication",
    "unauthorized",
    "invalid api key",
    "credit balance",
    "no space left",
    "prompt is too long",
    "context length",
    "not found",
    "port pool exhausted",
];

const TRANSIENT_SIGNATURES: &[&str] = &[
    "timed out",
    "timeout",
    "rate limit",
    "too many requests",
    "overloaded",
    "connection reset",
    "connection refused",
    "network",
    "temporarily unavailable",
    "terminated by signal",
    "lock contention",
];

const FIXABLE_SIGNATURES: &[&str] = &[
    "test",
    "assert",
    "compile",
    "build failed",
    "lint",
    "type error",
    "syntax error",
    "verification failed",
    "merge conflict",
];

fn matches_any(message: &str, signatures: &[&str]) -> bool {
    signatures.iter().any(|sig| message.contains(sig))
}

/// Classify the terminal outcome of a phase.
pub fn classify(outcome: &Outcome) -> FailureKind {
    if outcome.success {
        return FailureKind::Unknown;
    }
    if outcome.error_class == ErrorClass::NonRetryable {
        return FailureKind::Fatal;
    }

    let message = outcome.error.as_deref().unwrap_or_default().to_lowercase();
    if matches_any(&message, FATAL_SIGNATURES) {
        return FailureKind::Fatal;
    }
    if outcome.error_class == ErrorClass::RetryableTimeout
        || matches_any(&message, TRANSIENT_SIGNATURES)
    {
        return FailureKind::Retriable;
    }
    if outcome.error_class == ErrorClass::RetryableExecutionError
        && matches_any(&message, FIXABLE_SIGNATURES)
    {
        return FailureKind::Fixable;
    }
    FailureKind::Unknown
}

pub struct RecoveryService {
    store: Arc<dyn ExecutionStore>,
    board: Arc<dyn BoardStore>,
    sink: Arc<dyn EscalationSink>,
    config: RecoveryConfig,
    escalations_dir: PathBuf,
}

impl RecoveryService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        board: Arc<dyn BoardStore>,
        sink: Arc<dyn EscalationSink>,
        config: RecoveryConfig,
        state_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            store,
            board,
            sink,
            config,
            escalations_dir: state_dir.as_ref().join("escalations"),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Next step for `record` after a failure of `kind`.
    ///
    /// Pure: the caller bumps the record's counters when it acts.
    pub fn decide(&self, record: &ExecutionRecord, kind: FailureKind) -> RecoveryAction {
        match kind {
            FailureKind::Retriable if record.retry_rounds < self.config.max_retry_rounds => {
                RecoveryAction::Retry
            }
            FailureKind::Fixable if record.fix_attempts < self.config.max_fix_attempts => {
                let feedback = record
                    .last_error()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "the previous attempt failed".to_string());
                RecoveryAction::Simplify { feedback }
            }
            FailureKind::Unknown if record.retry_rounds == 0 => {
                RecoveryAction::Retry
            }
            _ => RecoveryAction::Escalate,
        }
    }

    /// Record a finished phase and persist its checkpoint.
    #[instrument(skip(self, record, files), fields(execution_id = %record.execution_id))]
    pub async fn checkpoint(
        &self,
        record: &mut ExecutionRecord,
        phase: &str,
        commit: Option<String>,
        files: &[String],
    ) -> DomainResult<Checkpoint> {
        let sequence = self
            .store
            .checkpoints(&record.execution_id)
            .await?
            .last()
            .map_or(1, |c| c.sequence + 1);

        record.complete_phase(phase, commit, files);
        let checkpoint = Checkpoint {
            execution_id: record.execution_id.clone(),
            sequence,
            phase: phase.to_string(),
            commit: record.last_commit.clone(),
            files_touched: record.files_touched.clone(),
            created_at: record.updated_at,
        };
        self.store.append_checkpoint(&checkpoint).await?;
        self.store.save(record).await?;
        info!(phase, sequence, "checkpoint written");
        Ok(checkpoint)
    }

    /// Phases already completed according to the checkpoints of `execution_id`.
    pub async fn resume_point(&self, execution_id: &ExecutionId) -> DomainResult<Vec<String>> {
        let mut phases: Vec<String> = Vec::new();
        for checkpoint in self.store.checkpoints(execution_id).await? {
            if !phases.contains(&checkpoint.phase) {
                phases.push(checkpoint.phase);
            }
        }
        Ok(phases)
    }

    /// Commit whatever the failed execution left in its workspace.
    ///
    /// Returns the save-point commit, or `None` when disabled or there was
    /// nothing to keep.
    #[instrument(skip(self, record), fields(execution_id = %record.execution_id))]
    pub async fn preserve_partial(
        &self,
        record: &mut ExecutionRecord,
        workspace: &Path,
    ) -> DomainResult<Option<String>> {
        if !self.config.preserve_partial {
            return Ok(None);
        }
        let message = format!(
            "drover(provisional): {} [{}]",
            record.task, record.execution_id
        );
        let commit = git::commit_all(workspace, &message).await?;
        if let Some(sha) = &commit {
            info!(commit = %sha, "provisional save-point committed");
            record.provisional_ref = Some(sha.clone());
            for file in git::files_in_commit(workspace, sha).await? {
                if !record.files_touched.contains(&file) {
                    record.files_touched.push(file);
                }
            }
            record.touch();
            self.store.save(record).await?;
        }
        Ok(commit)
    }

    /// Reset the workspace of `execution_id` to its base commit.
    ///
    /// Operator action only. The record ends `RolledBack` and the task
    /// `Failed`.
    #[instrument(skip(self))]
    pub async fn rollback(&self, execution_id: &ExecutionId) -> DomainResult<ExecutionRecord> {
        let mut record = self
            .store
            .load(execution_id)
            .await?
            .ok_or_else(|| DomainError::ExecutionNotFound(execution_id.to_string()))?;

        if record.status == ExecutionStatus::Running {
            return Err(DomainError::ValidationFailed(format!(
                "execution {execution_id} is still running; cancel it first"
            )));
        }
        let (Some(base), Some(workspace)) = (record.base_commit.clone(), record.workspace_path.clone())
        else {
            return Err(DomainError::ValidationFailed(format!(
                "execution {execution_id} never acquired a workspace"
            )));
        };

        let later = self.later_executions(&record, Path::new(&workspace), &base).await?;
        if !later.is_empty() {
            let ids: Vec<String> = later.iter().map(ToString::to_string).collect();
            return Err(DomainError::ValidationFailed(format!(
                "execution {execution_id} cannot be rolled back: later executions {} committed on top of it; roll those back first",
                ids.join(", ")
            )));
        }

        git::reset_hard(Path::new(&workspace), &base).await?;
        record.finish(ExecutionStatus::RolledBack);
        self.store.save(&record).await?;

        let meta = TransitionMeta::failed(Some(execution_id.clone()), ROLLBACK_REASON);
        match self.board.transition(&record.task, TaskStatus::Failed, meta).await {
            Ok(true) => {}
            Ok(false) => warn!(task = %record.task, "task no longer owned by this execution; board left as is"),
            Err(DomainError::TaskNotFound(_)) => {
                warn!(task = %record.task, "task not found on the board")
            }
            Err(err) => return Err(err),
        }

        info!(base_commit = %base, workspace = %workspace, "execution rolled back");
        Ok(record)
    }

    /// Other executions whose commits sit between `base` and the workspace
    /// `HEAD`. Resetting past them would drop their finished work.
    async fn later_executions(
        &self,
        record: &ExecutionRecord,
        workspace: &Path,
        base: &str,
    ) -> DomainResult<Vec<ExecutionId>> {
        let commits = git::commits_since(workspace, base).await?;
        if commits.is_empty() {
            return Ok(Vec::new());
        }
        let own_tag = format!("[{}]", record.execution_id);
        let mut later: Vec<ExecutionId> = Vec::new();

        for (_, subject) in &commits {
            if subject.starts_with("drover") && !subject.ends_with(&own_tag) {
                let tagged = subject
                    .rsplit_once('[')
                    .and_then(|(_, rest)| rest.strip_suffix(']'))
                    .and_then(ExecutionId::parse);
                if let Some(id) = tagged {
                    if !later.contains(&id) {
                        later.push(id);
                    }
                }
            }
        }

        for other in self.store.list().await? {
            if other.execution_id == record.execution_id
                || other.workspace_path != record.workspace_path
                || later.contains(&other.execution_id)
            {
                continue;
            }
            let owns_commit = [other.last_commit.as_deref(), other.provisional_ref.as_deref()]
                .into_iter()
                .flatten()
                .filter(|reference| !reference.is_empty())
                .any(|reference| commits.iter().any(|(sha, _)| sha.starts_with(reference)));
            if owns_commit {
                later.push(other.execution_id);
            }
        }
        Ok(later)
    }

    /// Hand `record` to a human.
    ///
    /// Writes `<state_dir>/escalations/<id>.json`, marks the record
    /// `Escalated` and delivers the report to the sink. Delivery failures are
    /// logged, never returned.
    #[instrument(skip(self, record, summary), fields(execution_id = %record.execution_id))]
    pub async fn escalate(
        &self,
        record: &mut ExecutionRecord,
        kind: FailureKind,
        summary: &str,
        suggested_action: Option<SuggestedAction>,
    ) -> DomainResult<EscalationReport> {
        let mut report = EscalationReport::from_record(record, kind, summary);
        if let Some(action) = suggested_action {
            report = report.with_action(action);
        }
        if let Some(reference) = &record.provisional_ref {
            report = report.with_action(SuggestedAction::InspectProvisional {
                reference: reference.clone(),
            });
        }
        if kind == FailureKind::Fixable {
            report = report.with_action(SuggestedAction::SplitTask);
        }
        if record.base_commit.is_some() {
            report = report.with_action(SuggestedAction::Rollback);
        }
        report = report.with_action(SuggestedAction::ResetTask);

        let path = self
            .escalations_dir
            .join(format!("{}.json", record.execution_id));
        let json = serde_json::to_vec_pretty(&report)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &json))
            .await
            .map_err(|e| DomainError::Io(format!("escalation writer panicked: {e}")))??;

        record.finish(ExecutionStatus::Escalated);
        self.store.save(record).await?;

        if let Err(err) = self.sink.deliver(&report).await {
            warn!(error = %err, "escalation delivery failed");
        }
        info!(path = %path.display(), kind = %kind, "execution escalated");
        Ok(report)
    }
}
