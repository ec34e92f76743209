//! Execution wrapper.
//!
//! Runs one phase of one task through a [`Worker`], enforcing the phase
//! deadline, classifying every attempt and retrying retryable failures with
//! exponential backoff. Each attempt leaves a transcript under
//! `<state_dir>/transcripts/<execution_id>/<phase>/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::models::{
    slugify, ErrorClass, ExecutionId, Outcome, RetryConfig, WorkerError, WorkerEvent, WorkerExit,
    WorkerInvocation,
};
use crate::domain::ports::Worker;
use crate::services::isolation::IsolatedContext;

/// Message carried by outcomes of cancelled phases.
pub const CANCELLED: &str = "cancelled";

const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "429",
    "overloaded",
];

const USAGE_SIGNATURES: &[&str] = &[
    "usage:",
    "unknown option",
    "unexpected argument",
    "invalid value",
];

/// Exponential backoff between attempts of one phase.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Applied on top of the capped delay for timeouts and rate limits
    pub slow_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        slow_multiplier: u32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            slow_multiplier: slow_multiplier.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.slow_multiplier,
        )
    }

    /// Delay before the attempt after `failed_attempt` (1-based).
    ///
    /// `initial * 2^(n-1)`, capped at `max_backoff`, then multiplied by
    /// `slow_multiplier` when `slow`.
    pub fn delay_for(&self, failed_attempt: u32, slow: bool) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        if slow {
            base.saturating_mul(self.slow_multiplier)
        } else {
            base
        }
    }
}

/// One phase to run.
#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub execution_id: ExecutionId,
    pub phase: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Deadline of a single attempt
    pub timeout: Duration,
    pub model: Option<String>,
    /// Cancels the phase, including any backoff wait
    pub cancel: CancellationToken,
}

impl PhaseRequest {
    pub fn new(
        execution_id: &ExecutionId,
        phase: &str,
        prompt: impl Into<String>,
        context: &IsolatedContext,
        timeout: Duration,
    ) -> Self {
        Self {
            execution_id: execution_id.clone(),
            phase: phase.to_string(),
            prompt: prompt.into(),
            working_dir: context.path.clone(),
            env: context.env.clone(),
            timeout,
            model: None,
            cancel: CancellationToken::new(),
        }
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

/// What a single attempt produced.
#[derive(Debug)]
struct Attempt {
    class: ErrorClass,
    error: Option<String>,
    exit: Option<WorkerExit>,
    events: Vec<WorkerEvent>,
}

enum AttemptEnd {
    Finished(Result<WorkerExit, WorkerError>),
    TimedOut,
    Cancelled,
}

/// Classify a worker attempt that ran to an end.
pub fn classify_attempt(
    result: &Result<WorkerExit, WorkerError>,
    events: &[WorkerEvent],
) -> (ErrorClass, Option<String>) {
    let exit = match result {
        Ok(exit) => exit,
        Err(WorkerError::Cancelled) => {
            return (ErrorClass::NonRetryable, Some(CANCELLED.to_string()))
        }
        Err(err @ WorkerError::Io(_)) => {
            return (ErrorClass::RetryableProcessError, Some(err.to_string()))
        }
        Err(err) => return (ErrorClass::NonRetryable, Some(err.to_string())),
    };

    if exit.exit_code == Some(2) {
        let stderr = exit.stderr.to_lowercase();
        if USAGE_SIGNATURES.iter().any(|sig| stderr.contains(sig)) {
            return (
                ErrorClass::NonRetryable,
                Some(format!("worker rejected its arguments: {}", last_line(&exit.stderr))),
            );
        }
    }

    if let Some(reported) = events.iter().rev().find_map(WorkerEvent::reported_error) {
        return (
            ErrorClass::RetryableExecutionError,
            Some(reported.to_string()),
        );
    }

    match exit.exit_code {
        Some(0) => (ErrorClass::Success, None),
        Some(code) => {
            let detail = last_line(&exit.stderr);
            let message = if detail.is_empty() {
                format!("worker exited with code {code}")
            } else {
                format!("worker exited with code {code}: {detail}")
            };
            (ErrorClass::RetryableProcessError, Some(message))
        }
        None => (
            ErrorClass::RetryableProcessError,
            Some("worker terminated by signal".to_string()),
        ),
    }
}

/// Whether `message` looks like the worker hit a rate limit.
pub fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

/// Runs phases through a worker with deadline, retry and transcripts.
pub struct ExecutionWrapper {
    worker: Arc<dyn Worker>,
    policy: RetryPolicy,
    transcripts_dir: Option<PathBuf>,
    /// How long an interrupted attempt may take to wind down
    kill_grace: Duration,
}

impl ExecutionWrapper {
    pub fn new(worker: Arc<dyn Worker>, policy: RetryPolicy) -> Self {
        Self {
            worker,
            policy,
            transcripts_dir: None,
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_transcripts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcripts_dir = Some(dir.into());
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn worker_name(&self) -> &'static str {
        self.worker.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `phase` for `execution_id` inside `context`.
    pub async fn run(
        &self,
        execution_id: &ExecutionId,
        phase: &str,
        prompt: &str,
        context: &IsolatedContext,
        timeout: Duration,
    ) -> Outcome {
        self.execute(PhaseRequest::new(execution_id, phase, prompt, context, timeout))
            .await
    }

    /// Run a fully specified phase request.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id, phase = %request.phase))]
    pub async fn execute(&self, request: PhaseRequest) -> Outcome {
        let started = Instant::now();
        let mut attempt_no = 0u32;

        loop {
            attempt_no += 1;
            debug!(attempt = attempt_no, worker = self.worker.name(), "starting attempt");
            let attempt = self.attempt(&request, attempt_no).await;
            self.write_transcript(&request, attempt_no, &attempt).await;

            if attempt.class == ErrorClass::Success {
                info!(
                    attempt = attempt_no,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "phase succeeded"
                );
                return into_outcome(attempt, attempt_no, started);
            }

            let error = attempt.error.clone().unwrap_or_default();
            let exhausted = attempt_no >= self.policy.max_attempts;
            if !attempt.class.is_retryable() || exhausted || request.cancel.is_cancelled() {
                warn!(
                    attempt = attempt_no,
                    error_class = %attempt.class,
                    error = %error,
                    "phase failed"
                );
                return into_outcome(attempt, attempt_no, started);
            }

            let slow = attempt.class == ErrorClass::RetryableTimeout || is_rate_limited(&error);
            let delay = self.policy.delay_for(attempt_no, slow);
            warn!(
                attempt = attempt_no,
                max_attempts = self.policy.max_attempts,
                error_class = %attempt.class,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = request.cancel.cancelled() => {
                    let cancelled = Attempt {
                        class: ErrorClass::NonRetryable,
                        error: Some(CANCELLED.to_string()),
                        exit: attempt.exit,
                        events: attempt.events,
                    };
                    return into_outcome(cancelled, attempt_no, started);
                }
            }
        }
    }

    async fn attempt(&self, request: &PhaseRequest, attempt_no: u32) -> Attempt {
        let attempt_cancel = request.cancel.child_token();
        let invocation = WorkerInvocation::new(
            request.execution_id.clone(),
            request.phase.clone(),
            request.prompt.clone(),
            request.working_dir.clone(),
        )
        .with_env(request.env.clone())
        .with_model(request.model.clone())
        .with_cancel(attempt_cancel.clone());

        let (tx, mut rx) = mpsc::channel::<WorkerEvent>(256);
        let collector = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        let mut invoke = self.worker.invoke(invocation, tx);
        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let end = tokio::select! {
            result = &mut invoke => AttemptEnd::Finished(result),
            () = &mut deadline => AttemptEnd::TimedOut,
            () = request.cancel.cancelled() => AttemptEnd::Cancelled,
        };

        if !matches!(end, AttemptEnd::Finished(_)) {
            attempt_cancel.cancel();
            let drain = self.kill_grace + Duration::from_secs(1);
            if tokio::time::timeout(drain, &mut invoke).await.is_err() {
                warn!(attempt = attempt_no, "worker did not stop within the grace period");
            }
        }
        drop(invoke);

        let events = collector.await.unwrap_or_default();

        match end {
            AttemptEnd::Finished(result) => {
                let (class, error) = classify_attempt(&result, &events);
                Attempt {
                    class,
                    error,
                    exit: result.ok(),
                    events,
                }
            }
            AttemptEnd::TimedOut => Attempt {
                class: ErrorClass::RetryableTimeout,
                error: Some(format!(
                    "phase timed out after {}s",
                    request.timeout.as_secs_f64()
                )),
                exit: None,
                events,
            },
            AttemptEnd::Cancelled => Attempt {
                class: ErrorClass::NonRetryable,
                error: Some(CANCELLED.to_string()),
                exit: None,
                events,
            },
        }
    }

    /// Directory holding the transcripts of `phase` of `execution_id`.
    pub fn transcript_dir(&self, execution_id: &ExecutionId, phase: &str) -> Option<PathBuf> {
        self.transcripts_dir
            .as_ref()
            .map(|dir| dir.join(execution_id.as_str()).join(slugify(phase)))
    }

    async fn write_transcript(&self, request: &PhaseRequest, attempt_no: u32, attempt: &Attempt) {
        let Some(dir) = self.transcript_dir(&request.execution_id, &request.phase) else {
            return;
        };
        if let Err(err) = write_transcript_files(&dir, attempt_no, attempt).await {
            warn!(dir = %dir.display(), error = %err, "failed to write transcript");
        }
    }
}

async fn write_transcript_files(
    dir: &Path,
    attempt_no: u32,
    attempt: &Attempt,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let mut log = String::new();
    match &attempt.exit {
        Some(exit) => {
            log.push_str(&exit.stdout);
            if !exit.stderr.is_empty() {
                if !log.is_empty() && !log.ends_with('\n') {
                    log.push('\n');
                }
                log.push_str("--- stderr ---\n");
                log.push_str(&exit.stderr);
            }
        }
        None => log.push_str("(no process output captured)\n"),
    }
    if let Some(error) = &attempt.error {
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&format!("--- {} ---\n{}\n", attempt.class, error));
    }
    tokio::fs::write(dir.join(format!("attempt-{attempt_no}.log")), log).await?;

    let mut jsonl = String::new();
    for event in &attempt.events {
        if let Ok(line) = serde_json::to_string(event) {
            jsonl.push_str(&line);
            jsonl.push('\n');
        }
    }
    tokio::fs::write(dir.join(format!("attempt-{attempt_no}.events.jsonl")), jsonl).await?;
    Ok(())
}

fn into_outcome(attempt: Attempt, attempts: u32, started: Instant) -> Outcome {
    Outcome {
        success: attempt.class == ErrorClass::Success,
        output: attempt.exit.map(|e| e.stdout).unwrap_or_default(),
        error_class: attempt.class,
        duration: started.elapsed(),
        attempts,
        error: attempt.error,
        events: attempt.events,
    }
}
