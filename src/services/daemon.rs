//! Dispatch daemon.
//!
//! A single control loop that watches the board, starts eligible tasks in
//! isolated workspaces, reaps finished jobs and reconciles the board with
//! execution records after a restart.
//!
//! Per cycle:
//! 1. reap finished jobs and release their isolation
//! 2. cancel jobs whose board line no longer carries their execution id
//! 3. reconcile `InProgress` tasks that have no live job
//! 4. pick eligible tasks, one per workspace lane, within the caps
//! 5. mark each `InProgress`, persist its record, spawn its job

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::fs_lock::FileLockGuard;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    slugify, Config, DaemonConfig, ExecutionId, ExecutionRecord, ExecutionStatus, FailureKind,
    Group, RecoveryAction, SuggestedAction, Task, TaskStatus, TransitionMeta, WorkerConfig,
};
use crate::domain::ports::{BoardStore, EscalationSink, ExecutionStore, Worker};
use crate::services::executor::{ExecutionWrapper, PhaseRequest, RetryPolicy};
use crate::services::isolation::IsolationManager;
use crate::services::recovery::{self, RecoveryService};
use crate::services::{git, task_graph};

/// Board reason for a task whose job panicked.
pub const PANIC_REASON: &str = "worker job panicked";

const ID_ATTEMPTS: usize = 8;

/// Counters over the daemon's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub cycles: u64,
    pub dispatched: u64,
    pub resumed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub escalated: u64,
    pub cancelled: u64,
    pub interrupted: u64,
    pub panicked: u64,
    pub reconciled: u64,
    pub active: usize,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Succeeded,
    Failed,
    Escalated,
    /// Stopped by an operator; the board no longer pointed at this execution
    Cancelled,
    /// Stopped by daemon shutdown; the record stays running for resume
    Interrupted,
    Panicked,
}

#[derive(Debug, Clone)]
struct JobReport {
    execution_id: ExecutionId,
    task: String,
    result: JobResult,
}

#[derive(Debug)]
struct ActiveJob {
    task: String,
    lane: String,
    cancel: CancellationToken,
}

/// One task to run, fresh or resumed.
#[derive(Debug, Clone)]
struct Job {
    execution_id: ExecutionId,
    task: Task,
    group: String,
    cancel: CancellationToken,
}

/// Everything a running job needs, shared by all jobs.
struct JobRunner {
    board: Arc<dyn BoardStore>,
    store: Arc<dyn ExecutionStore>,
    isolation: Arc<IsolationManager>,
    wrapper: ExecutionWrapper,
    recovery: RecoveryService,
    worker: WorkerConfig,
    phase_timeout: Duration,
    /// Cancelled when shutdown stops waiting for jobs
    halt: CancellationToken,
}

pub struct DispatchDaemon {
    board: Arc<dyn BoardStore>,
    store: Arc<dyn ExecutionStore>,
    isolation: Arc<IsolationManager>,
    runner: Arc<JobRunner>,
    config: DaemonConfig,
    state_dir: PathBuf,
    kill_grace: Duration,
    jobs: JoinSet<JobReport>,
    active: HashMap<ExecutionId, ActiveJob>,
    stats: DaemonStats,
}

fn lane_of(group: &str, task: &Task) -> String {
    slugify(task.workspace_override().unwrap_or(group))
}

/// Fill the prompt template for one phase.
///
/// Known placeholders: `{phase}`, `{task}`, `{group}`, `{execution_id}`,
/// `{feedback}`. Feedback is appended when the template has no slot for it.
pub fn render_prompt(
    template: &str,
    phase: &str,
    task: &str,
    group: &str,
    execution_id: &ExecutionId,
    feedback: Option<&str>,
) -> String {
    let mut prompt = template
        .replace("{phase}", phase)
        .replace("{task}", task)
        .replace("{group}", group)
        .replace("{execution_id}", execution_id.as_str());
    if template.contains("{feedback}") {
        prompt = prompt.replace("{feedback}", feedback.unwrap_or(""));
    } else if let Some(feedback) = feedback {
        prompt.push_str("\n\nThe previous attempt failed: ");
        prompt.push_str(feedback);
    }
    prompt
}

impl DispatchDaemon {
    pub fn new(
        config: &Config,
        board: Arc<dyn BoardStore>,
        store: Arc<dyn ExecutionStore>,
        worker: Arc<dyn Worker>,
        sink: Arc<dyn EscalationSink>,
        isolation: Arc<IsolationManager>,
    ) -> Self {
        let state_dir = PathBuf::from(&config.state_dir);
        let kill_grace = Duration::from_millis(config.worker.kill_grace_ms);
        let wrapper = ExecutionWrapper::new(worker, RetryPolicy::from_config(&config.retry))
            .with_transcripts(state_dir.join("transcripts"))
            .with_kill_grace(kill_grace);
        let recovery = RecoveryService::new(
            store.clone(),
            board.clone(),
            sink,
            config.recovery.clone(),
            &state_dir,
        );
        let runner = JobRunner {
            board: board.clone(),
            store: store.clone(),
            isolation: isolation.clone(),
            wrapper,
            recovery,
            worker: config.worker.clone(),
            phase_timeout: Duration::from_secs(config.worker.phase_timeout_secs),
            halt: CancellationToken::new(),
        };
        Self {
            board,
            store,
            isolation,
            runner: Arc::new(runner),
            config: config.daemon.clone(),
            state_dir,
            kill_grace,
            jobs: JoinSet::new(),
            active: HashMap::new(),
            stats: DaemonStats::default(),
        }
    }

    /// Override the per-attempt phase deadline.
    ///
    /// Only valid before the first cycle.
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        if let Some(runner) = Arc::get_mut(&mut self.runner) {
            runner.phase_timeout = timeout;
        }
        self
    }

    pub fn stats(&self) -> DaemonStats {
        DaemonStats {
            active: self.active.len(),
            ..self.stats.clone()
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Hold the single-instance lock at `<state_dir>/daemon.lock`.
    pub fn lock_instance(&self) -> DomainResult<FileLockGuard> {
        let path = self.state_dir.join("daemon.lock");
        match FileLockGuard::try_acquire(&path)? {
            Some(guard) => Ok(guard),
            None => Err(DomainError::ValidationFailed(format!(
                "another daemon already holds {}",
                path.display()
            ))),
        }
    }

    /// Run until `shutdown` is cancelled, then drain running jobs.
    pub async fn run(&mut self, shutdown: CancellationToken) -> DomainResult<DaemonStats> {
        let _instance = self.lock_instance()?;
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval_ms,
            worker = self.runner.wrapper.worker_name(),
            "daemon started"
        );

        loop {
            if let Err(err) = self.run_cycle().await {
                warn!(error = %err, "dispatch cycle failed");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(poll) => {}
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    self.on_joined(joined).await;
                }
            }
        }

        info!(active = self.active.len(), "shutdown requested, draining jobs");
        self.drain(Duration::from_millis(self.config.shutdown_grace_ms))
            .await;
        info!(stats = ?self.stats(), "daemon stopped");
        Ok(self.stats())
    }

    /// One pass of the control loop.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) -> DomainResult<DaemonStats> {
        self.stats.cycles += 1;
        self.reap_finished().await;

        let text = self.board.read_text().await?;
        let groups = task_graph::parse(&text);

        self.cancel_lost_jobs(&groups);
        self.reconcile(&groups).await;

        if task_graph::has_pending_work(&text) {
            self.dispatch(&groups).await?;
        } else {
            debug!("no pending work on the board");
        }
        Ok(self.stats())
    }

    /// Wait for every running job and reap it.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.jobs.join_next().await {
            self.on_joined(joined).await;
        }
    }

    /// Give running jobs `grace` to finish, then interrupt them.
    pub async fn drain(&mut self, grace: Duration) {
        if self.jobs.is_empty() {
            return;
        }
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return;
        }

        warn!(active = self.active.len(), "grace period elapsed, interrupting jobs");
        self.runner.halt.cancel();
        let settle = self.kill_grace + Duration::from_secs(2);
        if tokio::time::timeout(settle, self.wait_idle()).await.is_err() {
            error!(active = self.active.len(), "jobs ignored interruption, aborting");
            self.jobs.abort_all();
            while self.jobs.join_next().await.is_some() {}
            for (execution_id, _) in self.active.drain() {
                self.isolation.release(&execution_id).await;
            }
        }
    }

    async fn reap_finished(&mut self) {
        while let Some(joined) = self.jobs.try_join_next() {
            self.on_joined(joined).await;
        }
    }

    async fn on_joined(&mut self, joined: Result<JobReport, tokio::task::JoinError>) {
        match joined {
            Ok(report) => self.on_report(report).await,
            Err(err) if err.is_cancelled() => debug!("job aborted"),
            Err(err) => error!(error = %err, "job failed to join"),
        }
    }

    async fn on_report(&mut self, report: JobReport) {
        self.isolation.release(&report.execution_id).await;
        self.active.remove(&report.execution_id);

        match report.result {
            JobResult::Succeeded => self.stats.succeeded += 1,
            JobResult::Failed => self.stats.failed += 1,
            JobResult::Escalated => self.stats.escalated += 1,
            JobResult::Cancelled => self.stats.cancelled += 1,
            JobResult::Interrupted => self.stats.interrupted += 1,
            JobResult::Panicked => {
                self.stats.panicked += 1;
                self.attribute_panic(&report).await;
            }
        }
        debug!(
            execution_id = %report.execution_id,
            task = %report.task,
            result = ?report.result,
            "job reaped"
        );
    }

    async fn attribute_panic(&self, report: &JobReport) {
        error!(execution_id = %report.execution_id, task = %report.task, "job panicked");
        match self.store.load(&report.execution_id).await {
            Ok(Some(mut record)) if !record.is_terminal() => {
                let phase = record.current_phase.clone().unwrap_or_default();
                record.record_error(&phase, PANIC_REASON, false);
                record.finish(ExecutionStatus::Failed);
                if let Err(err) = self.store.save(&record).await {
                    warn!(error = %err, "could not persist panicked record");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "could not load panicked record"),
        }
        let meta = TransitionMeta::failed(Some(report.execution_id.clone()), PANIC_REASON);
        if let Err(err) = self
            .board
            .transition(&report.task, TaskStatus::Failed, meta)
            .await
        {
            warn!(error = %err, "could not mark panicked task failed");
        }
    }

    fn cancel_lost_jobs(&self, groups: &[Group]) {
        for (execution_id, job) in &self.active {
            if job.cancel.is_cancelled() {
                continue;
            }
            let still_ours = groups
                .iter()
                .find_map(|g| g.find(&job.task))
                .is_some_and(|t| {
                    t.status == TaskStatus::InProgress && t.execution_id.as_ref() == Some(execution_id)
                });
            if !still_ours {
                info!(execution_id = %execution_id, task = %job.task, "board no longer owns execution, cancelling");
                job.cancel.cancel();
            }
        }
    }

    /// Settle `InProgress` tasks that have no live job.
    ///
    /// Errors stay with the task that caused them; the rest of the board is
    /// still reconciled and dispatched.
    async fn reconcile(&mut self, groups: &[Group]) {
        for group in groups {
            for task in &group.tasks {
                if task.status != TaskStatus::InProgress {
                    continue;
                }
                let Some(execution_id) = task.execution_id.clone() else {
                    self.fail_unreconciled(task, None, "in progress without an execution id")
                        .await;
                    continue;
                };
                if self.active.contains_key(&execution_id) {
                    continue;
                }
                match self.reconcile_task(group, task, execution_id.clone()).await {
                    Ok(()) => {}
                    Err(err @ DomainError::LockContention { .. }) => {
                        warn!(execution_id = %execution_id, task = %task.description, error = %err, "board busy, reconciling next cycle");
                    }
                    Err(err) => {
                        let reason = format!("could not reconcile execution: {err}");
                        self.fail_unreconciled(task, Some(execution_id), &reason).await;
                    }
                }
            }
        }
    }

    async fn fail_unreconciled(&mut self, task: &Task, execution_id: Option<ExecutionId>, reason: &str) {
        warn!(task = %task.description, reason, "marking unreconcilable task failed");
        let meta = TransitionMeta::failed(execution_id, reason);
        match self.board.transition(task.key(), TaskStatus::Failed, meta).await {
            Ok(true) => self.stats.failed += 1,
            Ok(false) => debug!(task = %task.description, "task changed under us, leaving it"),
            Err(err) => warn!(task = %task.description, error = %err, "could not mark task failed"),
        }
    }

    async fn reconcile_task(
        &mut self,
        group: &Group,
        task: &Task,
        execution_id: ExecutionId,
    ) -> DomainResult<()> {
        match self.store.load(&execution_id).await? {
            Some(record) if record.is_terminal() => {
                let (status, meta) = match record.status {
                    ExecutionStatus::Succeeded => (
                        TaskStatus::Done,
                        TransitionMeta::done(execution_id.clone(), record.result_ref()),
                    ),
                    status => {
                        let reason = record
                            .last_error()
                            .map_or_else(|| status.to_string(), |e| e.message.clone());
                        (
                            TaskStatus::Failed,
                            TransitionMeta::failed(Some(execution_id.clone()), reason),
                        )
                    }
                };
                info!(execution_id = %execution_id, task = %task.description, to = %status, "applying finished execution to the board");
                self.board.transition(task.key(), status, meta).await?;
                self.stats.reconciled += 1;
            }
            existing => {
                if !self.has_capacity() || self.lane_busy(&lane_of(&group.name, task)) {
                    return Ok(());
                }
                if existing.is_none() {
                    warn!(execution_id = %execution_id, task = %task.description, "execution record missing, starting over");
                    let record = ExecutionRecord::new(execution_id.clone(), &task.description, &group.name);
                    self.store.save(&record).await?;
                } else {
                    info!(execution_id = %execution_id, task = %task.description, "resuming execution");
                }
                self.stats.resumed += 1;
                self.spawn_job(execution_id, task.clone(), group.name.clone());
            }
        }
        Ok(())
    }

    fn has_capacity(&self) -> bool {
        self.active.len() < self.config.max_concurrent
    }

    fn lane_busy(&self, lane: &str) -> bool {
        self.active.values().any(|job| job.lane == lane)
    }

    async fn dispatch(&mut self, groups: &[Group]) -> DomainResult<()> {
        let candidates: Vec<(String, Task)> = task_graph::eligible(groups)
            .into_iter()
            .flat_map(|(group, tasks)| tasks.into_iter().map(move |t| (group.clone(), t)))
            .collect();

        let mut lanes_taken: HashSet<String> = HashSet::new();
        let mut started = 0usize;

        for (group, task) in candidates {
            if started >= self.config.max_dispatch_per_cycle || !self.has_capacity() {
                break;
            }
            let lane = lane_of(&group, &task);
            if self.lane_busy(&lane) || !lanes_taken.insert(lane) {
                continue;
            }

            let execution_id = self.fresh_execution_id().await?;
            let meta = TransitionMeta::started(execution_id.clone());
            match self.board.transition(task.key(), TaskStatus::InProgress, meta).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task = %task.description, "task changed under us, skipping");
                    continue;
                }
                Err(err @ DomainError::LockContention { .. }) => {
                    warn!(error = %err, "board busy, deferring dispatch");
                    break;
                }
                Err(err) => return Err(err),
            }

            let record = ExecutionRecord::new(execution_id.clone(), &task.description, &group);
            self.store.save(&record).await?;

            info!(
                execution_id = %execution_id,
                task = %task.description,
                group = %group,
                "task dispatched"
            );
            self.stats.dispatched += 1;
            started += 1;
            self.spawn_job(execution_id, task, group);
        }
        Ok(())
    }

    async fn fresh_execution_id(&self) -> DomainResult<ExecutionId> {
        for _ in 0..ID_ATTEMPTS {
            let candidate = ExecutionId::generate();
            if !self.store.exists(&candidate).await? && !self.active.contains_key(&candidate) {
                return Ok(candidate);
            }
            debug!(execution_id = %candidate, "execution id collision, regenerating");
        }
        Err(DomainError::ValidationFailed(
            "could not generate an unused execution id".to_string(),
        ))
    }

    fn spawn_job(&mut self, execution_id: ExecutionId, task: Task, group: String) {
        let cancel = self.runner.halt.child_token();
        self.active.insert(
            execution_id.clone(),
            ActiveJob {
                task: task.description.clone(),
                lane: lane_of(&group, &task),
                cancel: cancel.clone(),
            },
        );

        let job = Job {
            execution_id: execution_id.clone(),
            task,
            group,
            cancel,
        };
        let runner = self.runner.clone();
        let task_key = job.task.description.clone();
        self.jobs.spawn(async move {
            match AssertUnwindSafe(runner.run_job(job)).catch_unwind().await {
                Ok(report) => report,
                Err(_) => JobReport {
                    execution_id,
                    task: task_key,
                    result: JobResult::Panicked,
                },
            }
        });
    }
}

impl JobRunner {
    async fn run_job(&self, job: Job) -> JobReport {
        let result = match self.execute(&job).await {
            Ok(result) => result,
            Err(err) => {
                error!(execution_id = %job.execution_id, error = %err, "job failed");
                self.fail_job(&job, &err.to_string()).await;
                JobResult::Failed
            }
        };
        JobReport {
            execution_id: job.execution_id,
            task: job.task.description,
            result,
        }
    }

    #[instrument(skip(self, job), fields(execution_id = %job.execution_id, task = %job.task.description, group = %job.group))]
    async fn execute(&self, job: &Job) -> DomainResult<JobResult> {
        let mut record = match self.store.load(&job.execution_id).await? {
            Some(record) => record,
            None => ExecutionRecord::new(job.execution_id.clone(), &job.task.description, &job.group),
        };
        for phase in self.recovery.resume_point(&job.execution_id).await? {
            if !record.completed_phases.contains(&phase) {
                record.completed_phases.push(phase);
            }
        }

        let context = match self
            .isolation
            .acquire(&job.group, &job.execution_id, job.task.workspace_override())
            .await
        {
            Ok(context) => context,
            Err(err) => return self.isolation_failed(job, &mut record, &err).await,
        };

        record.workspace_path = Some(context.path.to_string_lossy().to_string());
        record.branch = Some(context.branch.clone());
        if record.base_commit.is_none() {
            record.base_commit = Some(context.base_commit.clone());
        }
        record.ports = Some(context.ports);
        record.touch();
        self.store.save(&record).await?;

        let model = job
            .task
            .model_hint()
            .map(str::to_string)
            .or_else(|| self.worker.default_model.clone());
        let phases = record.remaining_phases(&self.worker.phases);
        if !record.completed_phases.is_empty() {
            info!(completed = ?record.completed_phases, remaining = ?phases, "resuming from checkpoint");
        }

        for phase in phases {
            let mut feedback: Option<String> = None;
            loop {
                record.begin_phase(&phase);
                self.store.save(&record).await?;

                let prompt = render_prompt(
                    &self.worker.prompt_template,
                    &phase,
                    &job.task.description,
                    &job.group,
                    &job.execution_id,
                    feedback.as_deref(),
                );
                let request = PhaseRequest::new(&job.execution_id, &phase, prompt, &context, self.phase_timeout)
                    .with_model(model.clone())
                    .with_cancel(job.cancel.clone());
                let outcome = self.wrapper.execute(request).await;
                record.attempts += outcome.attempts;

                if outcome.success {
                    self.recovery
                        .checkpoint(&mut record, &phase, outcome.last_commit(), &outcome.files_touched())
                        .await?;
                    break;
                }

                if outcome.is_cancelled() {
                    return self.stopped(job, &mut record, &phase).await;
                }

                let kind = recovery::classify(&outcome);
                let message = outcome.error.clone().unwrap_or_else(|| "phase failed".to_string());
                record.record_error(&phase, &message, kind != FailureKind::Fatal);

                match self.recovery.decide(&record, kind) {
                    RecoveryAction::Retry => {
                        record.retry_rounds += 1;
                        self.store.save(&record).await?;
                        warn!(phase = %phase, kind = %kind, round = record.retry_rounds, "retrying phase");
                    }
                    RecoveryAction::Simplify { feedback: hint } => {
                        record.fix_attempts += 1;
                        self.store.save(&record).await?;
                        warn!(phase = %phase, attempt = record.fix_attempts, "re-running phase with failure feedback");
                        feedback = Some(hint);
                    }
                    RecoveryAction::Escalate => {
                        return self
                            .give_up(job, &mut record, &context.path, kind, &phase, &message)
                            .await;
                    }
                }
            }
        }

        self.succeed(job, &mut record, &context.path).await
    }

    async fn succeed(
        &self,
        job: &Job,
        record: &mut ExecutionRecord,
        workspace: &Path,
    ) -> DomainResult<JobResult> {
        let message = format!("drover: {} [{}]", job.task.description, job.execution_id);
        match git::commit_all(workspace, &message).await {
            Ok(Some(sha)) => {
                record.last_commit = Some(sha);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not commit remaining work"),
        }
        if record.last_commit.is_none() {
            record.last_commit = git::head_commit(workspace)
                .await
                .ok()
                .filter(|head| record.base_commit.as_ref() != Some(head));
        }

        record.finish(ExecutionStatus::Succeeded);
        self.store.save(record).await?;

        let result_ref = record.result_ref();
        let meta = TransitionMeta::done(job.execution_id.clone(), &result_ref);
        self.settle_board(job, TaskStatus::Done, meta).await;
        info!(result_ref = %result_ref, attempts = record.attempts, "task done");
        Ok(JobResult::Succeeded)
    }

    async fn give_up(
        &self,
        job: &Job,
        record: &mut ExecutionRecord,
        workspace: &Path,
        kind: FailureKind,
        phase: &str,
        message: &str,
    ) -> DomainResult<JobResult> {
        let provisional = match self.recovery.preserve_partial(record, workspace).await {
            Ok(sha) => sha,
            Err(err) => {
                warn!(error = %err, "could not save provisional work");
                None
            }
        };

        let summary = format!("{phase} failed ({kind}) after {} attempts", record.attempts);
        if let Err(err) = self.recovery.escalate(record, kind, &summary, None).await {
            warn!(error = %err, "escalation failed");
            record.finish(ExecutionStatus::Failed);
            self.store.save(record).await?;
        }

        let mut reason = format!("{phase}: {message}");
        if let Some(sha) = provisional {
            reason.push_str(&format!(" (provisional {})", short_sha(&sha)));
        }
        let meta = TransitionMeta::failed(Some(job.execution_id.clone()), reason);
        self.settle_board(job, TaskStatus::Failed, meta).await;
        Ok(if record.status == ExecutionStatus::Escalated {
            JobResult::Escalated
        } else {
            JobResult::Failed
        })
    }

    async fn stopped(
        &self,
        job: &Job,
        record: &mut ExecutionRecord,
        phase: &str,
    ) -> DomainResult<JobResult> {
        if self.halt.is_cancelled() {
            record.current_phase = None;
            record.touch();
            self.store.save(record).await?;
            info!(phase, "interrupted by shutdown, will resume on restart");
            return Ok(JobResult::Interrupted);
        }

        // Only a board change cancels a job, so the board already says why.
        record.record_error(phase, "cancelled", false);
        record.finish(ExecutionStatus::Cancelled);
        self.store.save(record).await?;
        info!(phase, task = %job.task.description, "execution cancelled");
        Ok(JobResult::Cancelled)
    }

    async fn isolation_failed(
        &self,
        job: &Job,
        record: &mut ExecutionRecord,
        err: &DomainError,
    ) -> DomainResult<JobResult> {
        let message = format!("isolation failed: {err}");
        record.record_error("isolation", &message, !err.is_fatal());
        let action = SuggestedAction::FixEnvironment {
            hint: err.to_string(),
        };
        if let Err(escalation_err) = self
            .recovery
            .escalate(record, FailureKind::Fatal, &message, Some(action))
            .await
        {
            warn!(error = %escalation_err, "escalation failed");
            record.finish(ExecutionStatus::Failed);
            self.store.save(record).await?;
        }
        let meta = TransitionMeta::failed(Some(job.execution_id.clone()), &message);
        self.settle_board(job, TaskStatus::Failed, meta).await;
        Ok(JobResult::Escalated)
    }

    /// Write the board side of a record that is already terminal.
    ///
    /// A failed write leaves the line `InProgress`; the next cycle's
    /// reconcile applies the stored record instead.
    async fn settle_board(&self, job: &Job, status: TaskStatus, meta: TransitionMeta) {
        match self.board.transition(&job.task.description, status, meta).await {
            Ok(true) => {}
            Ok(false) => warn!("task no longer owned by this execution, leaving the board as is"),
            Err(err) => {
                warn!(error = %err, to = %status, "board update failed, reconcile will apply the record");
            }
        }
    }

    /// Last-resort failure path when the job itself errored.
    async fn fail_job(&self, job: &Job, message: &str) {
        match self.store.load(&job.execution_id).await {
            Ok(Some(mut record)) if !record.is_terminal() => {
                let phase = record.current_phase.clone().unwrap_or_default();
                record.record_error(&phase, message, false);
                record.finish(ExecutionStatus::Failed);
                if let Err(err) = self.store.save(&record).await {
                    warn!(error = %err, "could not persist failed record");
                }
            }
            // Finished work is never overwritten by a late job error.
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not load record of failed job"),
        }
        let meta = TransitionMeta::failed(Some(job.execution_id.clone()), message);
        if let Err(err) = self
            .board
            .transition(&job.task.description, TaskStatus::Failed, meta)
            .await
        {
            warn!(error = %err, "could not mark task failed");
        }
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}
