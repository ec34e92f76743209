//! Mock worker for dry runs and tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::domain::models::{ExecutionId, WorkerError, WorkerEvent, WorkerExit, WorkerInvocation};
use crate::domain::ports::Worker;

/// Scripted result of one mock invocation.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Stdout text
    pub output: String,
    pub exit_code: i32,
    /// Events streamed before exiting
    pub events: Vec<WorkerEvent>,
    /// Simulated run time; cancellation interrupts it
    pub delay: Duration,
    /// Files written into the working directory
    pub writes: Vec<(String, String)>,
    /// Fail before "spawning"
    pub spawn_error: Option<MockSpawnError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockSpawnError {
    NotFound,
    InvalidInvocation,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            output: "Mock phase completed successfully.".to_string(),
            exit_code: 0,
            events: vec![],
            delay: Duration::ZERO,
            writes: vec![],
            spawn_error: None,
        }
    }
}

impl MockResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    /// Exit 1 after reporting `error` as a worker error event.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            exit_code: 1,
            events: vec![WorkerEvent::Error {
                message: error.into(),
            }],
            ..Default::default()
        }
    }

    /// Non-zero exit without a structured error.
    pub fn crash(exit_code: i32) -> Self {
        Self {
            output: String::new(),
            exit_code,
            ..Default::default()
        }
    }

    /// Run for `delay` before succeeding.
    pub fn hang(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn not_found() -> Self {
        Self {
            spawn_error: Some(MockSpawnError::NotFound),
            ..Default::default()
        }
    }

    pub fn with_event(mut self, event: WorkerEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_commit(self, sha: impl Into<String>) -> Self {
        self.with_event(WorkerEvent::Commit { sha: sha.into() })
    }

    pub fn with_write(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        let path = path.into();
        self.events.push(WorkerEvent::FileTouched { path: path.clone() });
        self.writes.push((path, contents.into()));
        self
    }
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    pub execution_id: ExecutionId,
    pub phase: String,
    pub prompt: String,
    pub env: BTreeMap<String, String>,
}

/// Mock worker with per-task scripted responses.
///
/// Queued responses are matched by a substring of the prompt; anything
/// unmatched gets the default response.
pub struct MockWorker {
    default_response: MockResponse,
    queued: Arc<Mutex<Vec<(String, VecDeque<MockResponse>)>>>,
    calls: Arc<Mutex<Vec<RecordedInvocation>>>,
}

impl MockWorker {
    pub fn new() -> Self {
        Self::with_default_response(MockResponse::default())
    }

    pub fn with_default_response(response: MockResponse) -> Self {
        Self {
            default_response: response,
            queued: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue `response` for the next invocation whose prompt contains `matcher`.
    pub async fn push_response(&self, matcher: impl Into<String>, response: MockResponse) {
        let matcher = matcher.into();
        let mut queued = self.queued.lock().await;
        if let Some((_, queue)) = queued.iter_mut().find(|(m, _)| *m == matcher) {
            queue.push_back(response);
        } else {
            queued.push((matcher, VecDeque::from([response])));
        }
    }

    async fn next_response(&self, prompt: &str) -> MockResponse {
        let mut queued = self.queued.lock().await;
        queued
            .iter_mut()
            .filter(|(matcher, queue)| !queue.is_empty() && prompt.contains(matcher.as_str()))
            .max_by_key(|(matcher, _)| matcher.len())
            .and_then(|(_, queue)| queue.pop_front())
            .unwrap_or_else(|| self.default_response.clone())
    }

    pub async fn invocations(&self) -> Vec<RecordedInvocation> {
        self.calls.lock().await.clone()
    }

    /// Number of invocations whose prompt contains `matcher`.
    pub async fn count_matching(&self, matcher: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.prompt.contains(matcher))
            .count()
    }
}

impl Default for MockWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for MockWorker {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn invoke(
        &self,
        invocation: WorkerInvocation,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerExit, WorkerError> {
        self.calls.lock().await.push(RecordedInvocation {
            execution_id: invocation.execution_id.clone(),
            phase: invocation.phase.clone(),
            prompt: invocation.prompt.clone(),
            env: invocation.env.clone(),
        });
        let response = self.next_response(&invocation.prompt).await;

        match response.spawn_error {
            Some(MockSpawnError::NotFound) => {
                return Err(WorkerError::NotFound("mock-worker".to_string()))
            }
            Some(MockSpawnError::InvalidInvocation) => {
                return Err(WorkerError::InvalidInvocation("scripted".to_string()))
            }
            None => {}
        }

        if !response.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(response.delay) => {}
                () = invocation.cancel.cancelled() => return Err(WorkerError::Cancelled),
            }
        } else if invocation.cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        for (path, contents) in &response.writes {
            let target = invocation.working_dir.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, contents).await?;
        }

        for event in response.events {
            let _ = events.send(event).await;
        }

        Ok(WorkerExit {
            exit_code: Some(response.exit_code),
            stdout: response.output,
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(prompt: &str) -> WorkerInvocation {
        WorkerInvocation::new(ExecutionId::generate(), "implement", prompt, ".")
    }

    #[tokio::test]
    async fn test_default_success() {
        let worker = MockWorker::new();
        let (tx, _rx) = mpsc::channel(8);
        let exit = worker.invoke(invocation("/implement x"), tx).await.unwrap();
        assert!(exit.is_zero());
        assert_eq!(worker.invocations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_queued_responses_by_prompt() {
        let worker = MockWorker::new();
        worker.push_response("build x", MockResponse::crash(2)).await;

        let (tx, _rx) = mpsc::channel(8);
        let exit = worker.invoke(invocation("/implement build x"), tx.clone()).await.unwrap();
        assert_eq!(exit.exit_code, Some(2));

        let exit = worker.invoke(invocation("/implement build x"), tx).await.unwrap();
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(worker.count_matching("build x").await, 2);
    }

    #[tokio::test]
    async fn test_failure_streams_error_event() {
        let worker = MockWorker::with_default_response(MockResponse::failure("tests failed"));
        let (tx, mut rx) = mpsc::channel(8);
        worker.invoke(invocation("/verify y"), tx).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.reported_error(), Some("tests failed"));
    }

    #[tokio::test]
    async fn test_hang_honours_cancellation() {
        let worker = MockWorker::with_default_response(MockResponse::hang(Duration::from_secs(30)));
        let inv = invocation("/implement slow");
        let cancel = inv.cancel.clone();
        let (tx, _rx) = mpsc::channel(8);

        let handle = tokio::spawn(async move { worker.invoke(inv, tx).await });
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(WorkerError::Cancelled)));
    }
}
