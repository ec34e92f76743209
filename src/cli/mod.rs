//! Command-line interface
//!
//! Clap definitions, shared wiring of the stores and the error exit path.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use crate::adapters::{FileBoardStore, JsonExecutionStore};
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

use commands::daemon::DaemonArgs;
use commands::exec::ExecArgs;
use commands::init::InitArgs;
use commands::task::TaskArgs;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Drover - dispatch board tasks to isolated coding-agent workers", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to .drover/config.yaml)
    #[arg(short, long, global = true, env = "DROVER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the default configuration and an example board
    Init(InitArgs),

    /// Run the dispatch daemon
    Daemon(DaemonArgs),

    /// Inspect and edit the task board
    Task(TaskArgs),

    /// Inspect executions, checkpoints and rollbacks
    Exec(ExecArgs),
}

/// Load configuration from `path`, or from the project default location.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Stores every command works against.
pub struct Stores {
    pub board: Arc<FileBoardStore>,
    pub executions: Arc<JsonExecutionStore>,
}

impl Stores {
    pub fn open(config: &Config) -> Self {
        let board = FileBoardStore::new(
            &config.board_path,
            Duration::from_millis(config.lock_timeout_ms),
        );
        let executions = JsonExecutionStore::new(executions_dir(config));
        Self {
            board: Arc::new(board),
            executions: Arc::new(executions),
        }
    }
}

pub fn executions_dir(config: &Config) -> PathBuf {
    Path::new(&config.state_dir).join("executions")
}

/// Report `err` and exit with status 1.
pub fn handle_error(err: anyhow::Error, json: bool) -> ! {
    if json {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({
            "error": err.to_string(),
            "causes": chain,
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("{} {err:#}", style("Error:").red().bold());
    }
    std::process::exit(1)
}
