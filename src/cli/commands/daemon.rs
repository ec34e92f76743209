//! Daemon CLI commands.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::fs_lock::FileLockGuard;
use crate::adapters::workers::{ClaudeCodeConfig, ClaudeCodeWorker, MockWorker};
use crate::adapters::LogEscalationSink;
use crate::cli::output::{output, CommandOutput};
use crate::cli::Stores;
use crate::domain::models::{Config, ExecutionStatus, TaskStatus};
use crate::domain::ports::{BoardStore, ExecutionStore, Worker};
use crate::infrastructure::config::ConfigLoader;
use crate::services::{DaemonStats, DispatchDaemon, IsolationManager};

#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommands,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Run the dispatch loop until interrupted
    Run {
        /// Run a single cycle and wait for the jobs it started
        #[arg(long)]
        once: bool,
        /// Use the mock worker instead of the configured one
        #[arg(long)]
        dry_run: bool,
        /// Override daemon.max_concurrent
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Override daemon.poll_interval_ms
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Show whether a daemon is running and what it is doing
    Status,
}

#[derive(Debug, serde::Serialize)]
pub struct DaemonRunOutput {
    pub worker: String,
    pub once: bool,
    pub stats: DaemonStats,
}

impl CommandOutput for DaemonRunOutput {
    fn to_human(&self) -> String {
        let s = &self.stats;
        let mut lines = vec![format!(
            "Daemon stopped after {} cycle(s) using the {} worker.",
            s.cycles, self.worker
        )];
        lines.push(format!("  Dispatched:  {}", s.dispatched));
        lines.push(format!("  Resumed:     {}", s.resumed));
        lines.push(format!("  Succeeded:   {}", s.succeeded));
        lines.push(format!("  Failed:      {}", s.failed));
        lines.push(format!("  Escalated:   {}", s.escalated));
        lines.push(format!("  Cancelled:   {}", s.cancelled));
        if s.interrupted > 0 {
            lines.push(format!("  Interrupted: {} (resume on next start)", s.interrupted));
        }
        if s.panicked > 0 {
            lines.push(format!("  Panicked:    {}", s.panicked));
        }
        lines.join("\n")
    }
}

#[derive(Debug, serde::Serialize)]
pub struct DaemonStatusOutput {
    pub running: bool,
    pub board_path: String,
    pub tasks: BTreeMap<String, usize>,
    pub running_executions: Vec<String>,
}

impl CommandOutput for DaemonStatusOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![if self.running {
            "Daemon: running".to_string()
        } else {
            "Daemon: not running".to_string()
        }];
        lines.push(format!("Board:  {}", self.board_path));
        for (status, count) in &self.tasks {
            lines.push(format!("  {status:<12} {count}"));
        }
        if !self.running_executions.is_empty() {
            lines.push(format!(
                "Running executions: {}",
                self.running_executions.join(", ")
            ));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: DaemonArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        DaemonCommands::Run {
            once,
            dry_run,
            max_concurrent,
            poll_interval_ms,
        } => {
            let mut config = config.clone();
            if let Some(max) = max_concurrent {
                config.daemon.max_concurrent = max;
            }
            if let Some(poll) = poll_interval_ms {
                config.daemon.poll_interval_ms = poll;
            }
            if dry_run {
                config.worker.kind = "mock".to_string();
            }
            ConfigLoader::validate(&config).context("Invalid daemon overrides")?;
            run(&config, once, json_mode).await
        }
        DaemonCommands::Status => status(config, json_mode).await,
    }
}

async fn run(config: &Config, once: bool, json_mode: bool) -> Result<()> {
    let stores = Stores::open(config);
    let worker = build_worker(config).await;
    let worker_name = worker.name().to_string();
    let isolation = Arc::new(IsolationManager::new(config.isolation.clone()));

    let mut daemon = DispatchDaemon::new(
        config,
        stores.board.clone(),
        stores.executions.clone(),
        worker,
        Arc::new(LogEscalationSink::new()),
        isolation,
    );

    let stats = if once {
        let _instance = daemon.lock_instance()?;
        daemon.run_cycle().await.context("Dispatch cycle failed")?;
        daemon.wait_idle().await;
        daemon.stats()
    } else {
        let shutdown = CancellationToken::new();
        tokio::spawn(wait_for_signal(shutdown.clone()));
        daemon.run(shutdown).await.context("Daemon failed")?
    };

    output(
        &DaemonRunOutput {
            worker: worker_name,
            once,
            stats,
        },
        json_mode,
    );
    Ok(())
}

async fn build_worker(config: &Config) -> Arc<dyn Worker> {
    if config.worker.kind == "mock" {
        info!("using the mock worker");
        return Arc::new(MockWorker::new());
    }
    let worker = ClaudeCodeWorker::new(ClaudeCodeConfig::from(&config.worker));
    if !worker.is_available().await {
        warn!(
            command = %config.worker.command,
            "worker CLI is not available; phases will fail until it is installed"
        );
    }
    Arc::new(worker)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}

async fn status(config: &Config, json_mode: bool) -> Result<()> {
    let stores = Stores::open(config);
    let lock_path = Path::new(&config.state_dir).join("daemon.lock");
    let running = if lock_path.exists() {
        FileLockGuard::try_acquire(&lock_path)
            .context("Failed to check the daemon lock")?
            .is_none()
    } else {
        false
    };

    let groups = stores.board.read().await.context("Failed to read the board")?;
    let mut tasks = BTreeMap::new();
    for status in [
        TaskStatus::Pending,
        TaskStatus::Blocked,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Failed,
    ] {
        tasks.insert(status.as_str().to_string(), 0);
    }
    for task in groups.iter().flat_map(|g| &g.tasks) {
        *tasks.entry(task.status.as_str().to_string()).or_insert(0) += 1;
    }

    let running_executions = stores
        .executions
        .list()
        .await
        .context("Failed to list executions")?
        .into_iter()
        .filter(|r| r.status == ExecutionStatus::Running)
        .map(|r| r.execution_id.to_string())
        .collect();

    output(
        &DaemonStatusOutput {
            running,
            board_path: config.board_path.clone(),
            tasks,
            running_executions,
        },
        json_mode,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_kind_builds_mock_worker() {
        let mut config = Config::default();
        config.worker.kind = "mock".to_string();
        assert_eq!(build_worker(&config).await.name(), "mock");
    }

    #[test]
    fn test_run_output_mentions_interrupted_jobs() {
        let out = DaemonRunOutput {
            worker: "mock".to_string(),
            once: false,
            stats: DaemonStats {
                cycles: 4,
                interrupted: 1,
                ..DaemonStats::default()
            },
        };
        let text = out.to_human();
        assert!(text.contains("4 cycle(s)"));
        assert!(text.contains("Interrupted: 1"));
    }
}
