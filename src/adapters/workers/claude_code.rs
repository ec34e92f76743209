//! Claude Code CLI worker.
//!
//! Spawns the `claude` CLI in print mode with `stream-json` output inside the
//! workspace and turns every stdout line into a [`WorkerEvent`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::models::{WorkerConfig, WorkerError, WorkerEvent, WorkerExit, WorkerInvocation};
use crate::domain::ports::Worker;

/// Claude Code CLI worker configuration.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    /// Path to claude CLI binary
    pub binary_path: String,
    /// Model used when the invocation names none
    pub default_model: Option<String>,
    /// Output format for print mode (text, json, stream-json)
    pub output_format: String,
    /// Additional CLI flags
    pub extra_flags: Vec<String>,
    /// Time between SIGTERM and SIGKILL on cancellation
    pub kill_grace: Duration,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            default_model: None,
            output_format: "stream-json".to_string(),
            extra_flags: vec![],
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl From<&WorkerConfig> for ClaudeCodeConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            binary_path: config.command.clone(),
            default_model: config.default_model.clone(),
            output_format: "stream-json".to_string(),
            extra_flags: config.extra_args.clone(),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }
}

pub struct ClaudeCodeWorker {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeWorker {
    pub fn new(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    /// Whether the CLI can be started at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.config.binary_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Build CLI arguments for an invocation.
    fn build_args(&self, invocation: &WorkerInvocation) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            self.config.output_format.clone(),
        ];
        if self.config.output_format == "stream-json" {
            args.push("--verbose".to_string());
        }

        if let Some(model) = invocation
            .model
            .as_ref()
            .or(self.config.default_model.as_ref())
        {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.extend(self.config.extra_flags.clone());
        args.push(invocation.prompt.clone());
        args
    }

    /// Parse one line of stream-json output.
    fn parse_stream_json(json: &Value) -> Vec<WorkerEvent> {
        let Some(event_type) = json.get("type").and_then(Value::as_str) else {
            return Vec::new();
        };
        let str_field = |key: &str| json.get(key).and_then(Value::as_str).map(str::to_string);

        match event_type {
            "assistant" | "content_block_delta" | "text" => {
                let mut events = Vec::new();
                if let Some(blocks) = json
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_array)
                {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    events.push(WorkerEvent::Text {
                                        content: text.to_string(),
                                    });
                                }
                            }
                            Some("tool_use") => events.push(WorkerEvent::ToolUse {
                                name: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown")
                                    .to_string(),
                            }),
                            _ => {}
                        }
                    }
                    return events;
                }

                let content = json
                    .get("content")
                    .or_else(|| json.get("text"))
                    .or_else(|| json.get("delta").and_then(|d| d.get("text")))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !content.is_empty() {
                    events.push(WorkerEvent::Text {
                        content: content.to_string(),
                    });
                }
                events
            }

            "tool_use" | "tool_use_block" => vec![WorkerEvent::ToolUse {
                name: str_field("name").unwrap_or_else(|| "unknown".to_string()),
            }],

            "usage" | "message_delta" => usage_event(json.get("usage").unwrap_or(json))
                .into_iter()
                .collect(),

            "result" => {
                let text = json
                    .get("result")
                    .map(|r| r.as_str().map_or_else(|| r.to_string(), str::to_string))
                    .unwrap_or_default();
                let is_error = json.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                    || json
                        .get("subtype")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s.starts_with("error"));
                let mut events: Vec<WorkerEvent> =
                    json.get("usage").and_then(usage_event).into_iter().collect();
                events.push(WorkerEvent::Result { text, is_error });
                events
            }

            "error" => {
                let message = json
                    .get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| str_field("message"))
                    .unwrap_or_else(|| "Unknown error".to_string());
                vec![WorkerEvent::Error { message }]
            }

            "phase" => vec![WorkerEvent::Phase {
                name: str_field("name").unwrap_or_default(),
                status: str_field("status").unwrap_or_default(),
            }],

            "file" => str_field("path")
                .map(|path| WorkerEvent::FileTouched { path })
                .into_iter()
                .collect(),

            "commit" => str_field("sha")
                .map(|sha| WorkerEvent::Commit { sha })
                .into_iter()
                .collect(),

            _ => Vec::new(),
        }
    }

    /// Parse a line of output (handles both JSON and plain text).
    pub fn parse_output_line(line: &str) -> Vec<WorkerEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        if trimmed.starts_with('{') {
            if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
                return Self::parse_stream_json(&json);
            }
        }

        vec![WorkerEvent::Text {
            content: line.to_string(),
        }]
    }

    /// SIGTERM the child, then SIGKILL it if it outlives the grace period.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(pid, error = %err, "SIGTERM failed");
            }
        }
        if tokio::time::timeout(self.config.kill_grace, child.wait())
            .await
            .is_err()
        {
            warn!("worker ignored SIGTERM, killing");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill worker");
            }
        }
    }
}

fn usage_event(usage: &Value) -> Option<WorkerEvent> {
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    (input > 0 || output > 0).then_some(WorkerEvent::Usage {
        input_tokens: input,
        output_tokens: output,
    })
}

#[async_trait]
impl Worker for ClaudeCodeWorker {
    fn name(&self) -> &'static str {
        "claude_code"
    }

    async fn invoke(
        &self,
        invocation: WorkerInvocation,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerExit, WorkerError> {
        if invocation.prompt.trim().is_empty() {
            return Err(WorkerError::InvalidInvocation("empty prompt".to_string()));
        }
        if !invocation.working_dir.is_dir() {
            return Err(WorkerError::InvalidInvocation(format!(
                "working directory {} does not exist",
                invocation.working_dir.display()
            )));
        }

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.args(self.build_args(&invocation))
            .current_dir(&invocation.working_dir)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkerError::NotFound(self.config.binary_path.clone())
            } else {
                WorkerError::Spawn(e.to_string())
            }
        })?;
        info!(
            execution_id = %invocation.execution_id,
            phase = %invocation.phase,
            pid = ?child.id(),
            "worker started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Io("failed to capture stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::Io("failed to capture stderr".to_string()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut stdout_text = String::new();
        let mut lines = BufReader::new(stdout).lines();
        let cancel = invocation.cancel.clone();
        let mut cancelled = false;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        stdout_text.push_str(&line);
                        stdout_text.push('\n');
                        for event in Self::parse_output_line(&line) {
                            let _ = events.send(event).await;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "failed to read worker stdout");
                        break;
                    }
                },
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        let status = if cancelled {
            None
        } else {
            tokio::select! {
                status = child.wait() => Some(status?),
                () = cancel.cancelled() => None,
            }
        };

        let Some(status) = status else {
            self.terminate(&mut child).await;
            stderr_task.abort();
            info!(execution_id = %invocation.execution_id, "worker cancelled");
            return Err(WorkerError::Cancelled);
        };

        let stderr_text = stderr_task.await.unwrap_or_default();
        debug!(
            execution_id = %invocation.execution_id,
            exit_code = ?status.code(),
            "worker exited"
        );
        Ok(WorkerExit {
            exit_code: status.code(),
            stdout: stdout_text,
            stderr: stderr_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ExecutionId;

    #[test]
    fn test_build_args() {
        let worker = ClaudeCodeWorker::new(ClaudeCodeConfig {
            default_model: Some("sonnet".to_string()),
            extra_flags: vec!["--dangerously-skip-permissions".to_string()],
            ..Default::default()
        });
        let invocation =
            WorkerInvocation::new(ExecutionId::generate(), "implement", "/implement build x", ".")
                .with_model(Some("haiku".to_string()));

        let args = worker.build_args(&invocation);
        assert_eq!(args[0], "--print");
        assert!(args.windows(2).any(|w| w[0] == "--output-format" && w[1] == "stream-json"));
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "haiku"));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/implement build x"));
    }

    #[test]
    fn test_parse_assistant_message_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"on it"},{"type":"tool_use","name":"Edit","id":"t1"}]}}"#;
        let events = ClaudeCodeWorker::parse_output_line(line);
        assert_eq!(
            events,
            vec![
                WorkerEvent::Text { content: "on it".to_string() },
                WorkerEvent::ToolUse { name: "Edit".to_string() },
            ]
        );
    }

    #[test]
    fn test_parse_result_error() {
        let line = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"result":"ran out of turns","usage":{"input_tokens":10,"output_tokens":2}}"#;
        let events = ClaudeCodeWorker::parse_output_line(line);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].reported_error(), Some("ran out of turns"));
    }

    #[test]
    fn test_parse_progress_events() {
        assert_eq!(
            ClaudeCodeWorker::parse_output_line(r#"{"type":"commit","sha":"abc"}"#),
            vec![WorkerEvent::Commit { sha: "abc".to_string() }]
        );
        assert_eq!(
            ClaudeCodeWorker::parse_output_line(r#"{"type":"file","path":"src/a.rs"}"#),
            vec![WorkerEvent::FileTouched { path: "src/a.rs".to_string() }]
        );
        assert_eq!(
            ClaudeCodeWorker::parse_output_line(r#"{"type":"error","error":{"message":"rate limit"}}"#),
            vec![WorkerEvent::Error { message: "rate limit".to_string() }]
        );
    }

    #[test]
    fn test_plain_text_and_unknown_events() {
        assert_eq!(
            ClaudeCodeWorker::parse_output_line("compiling..."),
            vec![WorkerEvent::Text { content: "compiling...".to_string() }]
        );
        assert!(ClaudeCodeWorker::parse_output_line(r#"{"type":"system","subtype":"init"}"#).is_empty());
        assert!(ClaudeCodeWorker::parse_output_line("   ").is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let worker = ClaudeCodeWorker::new(ClaudeCodeConfig {
            binary_path: "/definitely/not/a/claude".to_string(),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(8);
        let invocation = WorkerInvocation::new(ExecutionId::generate(), "implement", "go", ".");
        let err = worker.invoke(invocation, tx).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }
}
