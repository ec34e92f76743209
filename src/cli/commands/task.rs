//! Task board CLI commands.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use comfy_table::Cell;

use crate::adapters::fs_lock::FileLockGuard;
use crate::cli::output::{
    colorize_status, list_table, output, render_list, short_ref, truncate, CommandOutput,
};
use crate::cli::Stores;
use crate::domain::models::{
    Config, ExecutionStatus, Group, Task, TaskStatus, TaskTag, TransitionMeta,
};
use crate::domain::ports::{BoardStore, ExecutionStore};

/// Board reason of a task cancelled from the command line.
pub const OPERATOR_CANCEL_REASON: &str = "cancelled by operator";

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// List tasks on the board
    List {
        /// Only tasks of this group
        #[arg(short, long)]
        group: Option<String>,
        /// Only tasks with this status (pending, blocked, in_progress, done, failed)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Append a task to the end of a group
    Add {
        /// Group name; created when missing
        group: String,
        /// Task description, unique on the board
        description: String,
        /// Tags such as model:haiku, priority:high or workspace:shared
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },
    /// Move a failed task back to pending
    Reset {
        /// Task description
        task: String,
    },
    /// Cancel a task that is in progress
    Cancel {
        /// Task description
        task: String,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct TaskRow {
    pub group: String,
    pub description: String,
    pub status: String,
    pub execution_id: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub tags: Vec<String>,
    pub eligible: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct TaskListOutput {
    pub tasks: Vec<TaskRow>,
    pub total: usize,
}

impl CommandOutput for TaskListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["group", "status", "task", "execution", "detail"]);
        for row in &self.tasks {
            let detail = match (&row.result_ref, &row.error) {
                (Some(reference), _) => short_ref(reference).to_string(),
                (None, Some(error)) => truncate(error, 48),
                (None, None) if row.eligible => "ready".to_string(),
                (None, None) => String::new(),
            };
            table.add_row(vec![
                Cell::new(&row.group),
                Cell::new(colorize_status(&row.status)),
                Cell::new(truncate(&row.description, 60)),
                Cell::new(row.execution_id.as_deref().unwrap_or("-")),
                Cell::new(detail),
            ]);
        }
        render_list("task", &table, self.total)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct TaskActionOutput {
    pub success: bool,
    pub task: String,
    pub status: String,
    pub message: String,
}

impl CommandOutput for TaskActionOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

pub async fn execute(args: TaskArgs, config: &Config, json_mode: bool) -> Result<()> {
    let stores = Stores::open(config);
    match args.command {
        TaskCommands::List { group, status } => {
            let status = status
                .map(|s| {
                    TaskStatus::from_str(&s).with_context(|| format!("Unknown task status '{s}'"))
                })
                .transpose()?;
            let groups = stores.board.read().await.context("Failed to read the board")?;
            let tasks = list_rows(&groups, group.as_deref(), status);
            let total = tasks.len();
            output(&TaskListOutput { tasks, total }, json_mode);
        }
        TaskCommands::Add {
            group,
            description,
            tags,
        } => {
            let tags: Vec<TaskTag> = tags.iter().map(|t| TaskTag::parse(t)).collect();
            stores
                .board
                .append(&group, &description, &tags)
                .await
                .context("Failed to add task")?;
            let status = find_task(&stores, &description)
                .await?
                .map_or(TaskStatus::Pending, |t| t.status);
            output(
                &TaskActionOutput {
                    success: true,
                    task: description.clone(),
                    status: status.as_str().to_string(),
                    message: format!("Added '{description}' to {group} as {status}"),
                },
                json_mode,
            );
        }
        TaskCommands::Reset { task } => {
            let result = reset(&stores, &task).await?;
            output(&result, json_mode);
        }
        TaskCommands::Cancel { task } => {
            let result = cancel(&stores, config, &task).await?;
            output(&result, json_mode);
        }
    }
    Ok(())
}

fn list_rows(groups: &[Group], group: Option<&str>, status: Option<TaskStatus>) -> Vec<TaskRow> {
    let ready: Vec<(String, Vec<Task>)> = crate::services::task_graph::eligible(groups);
    groups
        .iter()
        .filter(|g| group.map_or(true, |name| g.name == name))
        .flat_map(|g| g.tasks.iter().map(move |t| (g, t)))
        .filter(|(_, t)| status.map_or(true, |s| t.status == s))
        .map(|(g, t)| TaskRow {
            group: g.name.clone(),
            description: t.description.clone(),
            status: t.status.as_str().to_string(),
            execution_id: t.execution_id.as_ref().map(ToString::to_string),
            result_ref: t.result_ref.clone(),
            error: t.error.clone(),
            tags: t.tags.iter().map(TaskTag::render).collect(),
            eligible: ready
                .iter()
                .any(|(name, tasks)| *name == g.name && tasks.iter().any(|r| r.key() == t.key())),
        })
        .collect()
}

async fn find_task(stores: &Stores, key: &str) -> Result<Option<Task>> {
    let groups = stores.board.read().await.context("Failed to read the board")?;
    Ok(groups.into_iter().find_map(|g| g.find(key).cloned()))
}

/// Whether every task before `key` in its group is done.
async fn predecessors_done(stores: &Stores, key: &str) -> Result<bool> {
    let groups = stores.board.read().await.context("Failed to read the board")?;
    Ok(groups
        .iter()
        .find(|g| g.find(key).is_some())
        .map_or(true, |g| {
            g.tasks
                .iter()
                .take_while(|t| t.key() != key)
                .all(|t| t.status == TaskStatus::Done)
        }))
}

async fn reset(stores: &Stores, key: &str) -> Result<TaskActionOutput> {
    let Some(task) = find_task(stores, key).await? else {
        bail!("Task not found: {key}");
    };
    if task.status != TaskStatus::Failed {
        bail!("Only failed tasks can be reset; '{key}' is {}", task.status);
    }

    let applied = stores
        .board
        .transition(key, TaskStatus::Pending, TransitionMeta::reset())
        .await
        .context("Failed to reset task")?;
    if !applied {
        bail!("Task '{key}' changed while it was being reset");
    }

    // Pending runs regardless of neighbours, so re-block behind unfinished work.
    let mut status = TaskStatus::Pending;
    if !predecessors_done(stores, key).await?
        && stores
            .board
            .transition(key, TaskStatus::Blocked, TransitionMeta::reset())
            .await
            .context("Failed to re-block task")?
    {
        status = TaskStatus::Blocked;
    }

    Ok(TaskActionOutput {
        success: true,
        task: key.to_string(),
        status: status.as_str().to_string(),
        message: format!("Reset '{key}' to {status}"),
    })
}

async fn cancel(stores: &Stores, config: &Config, key: &str) -> Result<TaskActionOutput> {
    let Some(task) = find_task(stores, key).await? else {
        bail!("Task not found: {key}");
    };
    if task.status != TaskStatus::InProgress {
        bail!("Only tasks in progress can be cancelled; '{key}' is {}", task.status);
    }

    let meta = TransitionMeta::failed(task.execution_id.clone(), OPERATOR_CANCEL_REASON);
    let applied = stores
        .board
        .transition(key, TaskStatus::Failed, meta)
        .await
        .context("Failed to cancel task")?;
    if !applied {
        bail!("Task '{key}' finished before it could be cancelled");
    }

    // A running daemon notices the board change and stops the job itself.
    let daemon_running = daemon_running(config)?;
    let mut message = format!("Cancelled '{key}'");
    if let Some(execution_id) = task.execution_id.as_ref() {
        if daemon_running {
            message.push_str(&format!("; the daemon will stop execution {execution_id}"));
        } else if let Some(mut record) = stores.executions.load(execution_id).await? {
            if record.status == ExecutionStatus::Running {
                record.finish(ExecutionStatus::Cancelled);
                stores.executions.save(&record).await?;
                message.push_str(&format!("; execution {execution_id} marked cancelled"));
            }
        }
    }

    Ok(TaskActionOutput {
        success: true,
        task: key.to_string(),
        status: TaskStatus::Failed.as_str().to_string(),
        message,
    })
}

fn daemon_running(config: &Config) -> Result<bool> {
    let lock_path = Path::new(&config.state_dir).join("daemon.lock");
    if !lock_path.exists() {
        return Ok(false);
    }
    Ok(FileLockGuard::try_acquire(&lock_path)
        .context("Failed to check the daemon lock")?
        .is_none())
}
