//! Execution CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::Cell;

use crate::adapters::LogEscalationSink;
use crate::cli::output::{
    colorize_status, list_table, output, render_list, short_ref, truncate, CommandOutput,
};
use crate::cli::Stores;
use crate::domain::models::{
    Checkpoint, Config, EscalationReport, ExecutionId, ExecutionRecord, ExecutionStatus,
};
use crate::domain::ports::ExecutionStore;
use crate::services::RecoveryService;

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(subcommand)]
    pub command: ExecCommands,
}

#[derive(Subcommand, Debug)]
pub enum ExecCommands {
    /// List execution records, newest first
    List {
        /// Only records with this status
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum number of records to display
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one execution record
    Show {
        /// Execution ID
        id: String,
    },
    /// List the checkpoints of an execution
    Checkpoints {
        /// Execution ID
        id: String,
    },
    /// Reset an execution's workspace to its base commit
    Rollback {
        /// Execution ID
        id: String,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct ExecListOutput {
    pub executions: Vec<ExecutionRecord>,
    pub total: usize,
}

impl CommandOutput for ExecListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "status", "group", "task", "phase", "updated"]);
        for record in &self.executions {
            let phase = record
                .current_phase
                .clone()
                .or_else(|| record.completed_phases.last().cloned())
                .unwrap_or_else(|| "-".to_string());
            table.add_row(vec![
                Cell::new(record.execution_id.as_str()),
                Cell::new(colorize_status(record.status.as_str())),
                Cell::new(&record.group),
                Cell::new(truncate(&record.task, 48)),
                Cell::new(phase),
                Cell::new(record.updated_at.format("%Y-%m-%d %H:%M").to_string()),
            ]);
        }
        render_list("execution", &table, self.total)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ExecShowOutput {
    pub record: ExecutionRecord,
    pub checkpoints: usize,
    pub transcripts: PathBuf,
    pub escalation: Option<EscalationReport>,
}

impl CommandOutput for ExecShowOutput {
    fn to_human(&self) -> String {
        let r = &self.record;
        let mut lines = vec![
            format!("Execution:   {}", r.execution_id),
            format!("Status:      {}", colorize_status(r.status.as_str())),
            format!("Task:        {}", r.task),
            format!("Group:       {}", r.group),
        ];
        if let Some(path) = &r.workspace_path {
            lines.push(format!("Workspace:   {path}"));
        }
        if let Some(branch) = &r.branch {
            lines.push(format!("Branch:      {branch}"));
        }
        if let Some(ports) = r.ports {
            lines.push(format!("Ports:       {} / {}", ports.primary, ports.secondary));
        }
        if let Some(base) = &r.base_commit {
            lines.push(format!("Base:        {}", short_ref(base)));
        }
        if let Some(commit) = &r.last_commit {
            lines.push(format!("Last commit: {}", short_ref(commit)));
        }
        if let Some(provisional) = &r.provisional_ref {
            lines.push(format!("Provisional: {}", short_ref(provisional)));
        }
        if let Some(phase) = &r.current_phase {
            lines.push(format!("Phase:       {phase}"));
        }
        lines.push(format!(
            "Completed:   {}",
            if r.completed_phases.is_empty() {
                "-".to_string()
            } else {
                r.completed_phases.join(", ")
            }
        ));
        lines.push(format!(
            "Attempts:    {} (retry rounds {}, fix attempts {})",
            r.attempts, r.retry_rounds, r.fix_attempts
        ));
        lines.push(format!("Checkpoints: {}", self.checkpoints));
        lines.push(format!("Created:     {}", r.created_at.to_rfc3339()));
        if let Some(finished) = r.finished_at {
            lines.push(format!("Finished:    {}", finished.to_rfc3339()));
        }
        lines.push(format!("Transcripts: {}", self.transcripts.display()));

        if !r.errors.is_empty() {
            lines.push(String::new());
            lines.push("Errors:".to_string());
            for error in &r.errors {
                lines.push(format!(
                    "  [{}] {}: {}",
                    error.timestamp.format("%H:%M:%S"),
                    error.phase,
                    truncate(&error.message, 100)
                ));
            }
        }
        if let Some(report) = &self.escalation {
            lines.push(String::new());
            lines.push(format!("Escalated ({}): {}", report.failure_kind, report.summary));
            for (i, action) in report.suggested_actions.iter().enumerate() {
                lines.push(format!("  {}. {}", i + 1, action.display_text()));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, serde::Serialize)]
pub struct CheckpointListOutput {
    pub execution_id: String,
    pub checkpoints: Vec<Checkpoint>,
    pub total: usize,
}

impl CommandOutput for CheckpointListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["seq", "phase", "commit", "files", "created"]);
        for checkpoint in &self.checkpoints {
            table.add_row(vec![
                Cell::new(checkpoint.sequence),
                Cell::new(&checkpoint.phase),
                Cell::new(checkpoint.commit.as_deref().map_or("-", short_ref)),
                Cell::new(checkpoint.files_touched.len()),
                Cell::new(checkpoint.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            ]);
        }
        render_list("checkpoint", &table, self.total)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RollbackOutput {
    pub execution_id: String,
    pub task: String,
    pub base_commit: Option<String>,
    pub workspace_path: Option<String>,
}

impl CommandOutput for RollbackOutput {
    fn to_human(&self) -> String {
        format!(
            "Rolled back execution {} to {} in {}.\nTask '{}' is now failed; reset it to run again.",
            self.execution_id,
            self.base_commit.as_deref().map_or("-", short_ref),
            self.workspace_path.as_deref().unwrap_or("-"),
            self.task
        )
    }
}

pub async fn execute(args: ExecArgs, config: &Config, json_mode: bool) -> Result<()> {
    let stores = Stores::open(config);
    match args.command {
        ExecCommands::List { status, limit } => {
            let status = status
                .map(|s| {
                    ExecutionStatus::from_str(&s)
                        .with_context(|| format!("Unknown execution status '{s}'"))
                })
                .transpose()?;
            let executions: Vec<_> = stores
                .executions
                .list()
                .await
                .context("Failed to list executions")?
                .into_iter()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .take(limit)
                .collect();
            let total = executions.len();
            output(&ExecListOutput { executions, total }, json_mode);
        }
        ExecCommands::Show { id } => {
            let id = parse_id(&id)?;
            let record = load(&stores, &id).await?;
            let checkpoints = stores.executions.checkpoints(&id).await?.len();
            let escalation = read_escalation(&config.state_dir, &id).await?;
            let transcripts = Path::new(&config.state_dir)
                .join("transcripts")
                .join(id.as_str());
            output(
                &ExecShowOutput {
                    record,
                    checkpoints,
                    transcripts,
                    escalation,
                },
                json_mode,
            );
        }
        ExecCommands::Checkpoints { id } => {
            let id = parse_id(&id)?;
            load(&stores, &id).await?;
            let checkpoints = stores
                .executions
                .checkpoints(&id)
                .await
                .context("Failed to read checkpoints")?;
            let total = checkpoints.len();
            output(
                &CheckpointListOutput {
                    execution_id: id.to_string(),
                    checkpoints,
                    total,
                },
                json_mode,
            );
        }
        ExecCommands::Rollback { id } => {
            let id = parse_id(&id)?;
            let recovery = RecoveryService::new(
                stores.executions.clone(),
                stores.board.clone(),
                Arc::new(LogEscalationSink::new()),
                config.recovery.clone(),
                &config.state_dir,
            );
            let record = recovery
                .rollback(&id)
                .await
                .with_context(|| format!("Failed to roll back execution {id}"))?;
            output(
                &RollbackOutput {
                    execution_id: id.to_string(),
                    task: record.task,
                    base_commit: record.base_commit,
                    workspace_path: record.workspace_path,
                },
                json_mode,
            );
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<ExecutionId> {
    ExecutionId::parse(raw).with_context(|| format!("Invalid execution id '{raw}'"))
}

async fn load(stores: &Stores, id: &ExecutionId) -> Result<ExecutionRecord> {
    stores
        .executions
        .load(id)
        .await
        .context("Failed to read execution record")?
        .with_context(|| format!("Execution record not found: {id}"))
}

async fn read_escalation(state_dir: &str, id: &ExecutionId) -> Result<Option<EscalationReport>> {
    let path = Path::new(state_dir)
        .join("escalations")
        .join(format!("{id}.json"));
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => {
            let report = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(Some(report))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}
