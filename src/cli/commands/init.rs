//! Implementation of the `drover init` command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::services::git;

const EXAMPLE_BOARD: &str = "\
# Tasks

## example
- [ ] describe the first task of this group
- [-] this one waits until the task above is done {priority:high}
";

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration
    #[arg(long, short)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub message: String,
    pub initialized_path: PathBuf,
    pub files_written: Vec<String>,
    pub git_excluded: bool,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        if !self.files_written.is_empty() {
            lines.push("\nWrote:".to_string());
            for file in &self.files_written {
                lines.push(format!("  - {file}"));
            }
        }
        if self.git_excluded {
            lines.push("\nAdded /.drover/ to .git/info/exclude".to_string());
        }
        lines.join("\n")
    }
}

pub async fn execute(args: InitArgs, json_mode: bool) -> Result<()> {
    let target_path = if args.path.is_absolute() {
        args.path.clone()
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&args.path)
    };

    let defaults = Config::default();
    let state_dir = target_path.join(&defaults.state_dir);
    let config_path = state_dir.join("config.yaml");

    if config_path.exists() && !args.force {
        let output_data = InitOutput {
            success: false,
            message: "Project already initialized. Use --force to overwrite the configuration."
                .to_string(),
            initialized_path: target_path,
            files_written: vec![],
            git_excluded: false,
        };
        output(&output_data, json_mode);
        return Ok(());
    }

    for dir in [
        state_dir.clone(),
        state_dir.join("executions"),
        state_dir.join("transcripts"),
        state_dir.join("escalations"),
    ] {
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let mut files_written = vec![];

    let yaml = serde_yaml::to_string(&defaults).context("Failed to render default configuration")?;
    fs::write(&config_path, yaml)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    files_written.push(relative(&target_path, &config_path));

    // An existing board is never overwritten, even with --force.
    let board_path = target_path.join(&defaults.board_path);
    if !board_path.exists() {
        fs::write(&board_path, EXAMPLE_BOARD)
            .await
            .with_context(|| format!("Failed to write {}", board_path.display()))?;
        files_written.push(relative(&target_path, &board_path));
    }

    let git_excluded = match git::exclude(&target_path, "/.drover/").await {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "not excluding state directory from git");
            false
        }
    };

    let output_data = InitOutput {
        success: true,
        message: if args.force {
            "Project reinitialized successfully.".to_string()
        } else {
            "Project initialized successfully.".to_string()
        },
        initialized_path: target_path,
        files_written,
        git_excluded,
    };

    output(&output_data, json_mode);
    Ok(())
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::task_graph;

    #[test]
    fn test_example_board_parses() {
        let groups = task_graph::parse(EXAMPLE_BOARD);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tasks.len(), 2);
        assert_eq!(task_graph::eligible(&groups)[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_init_writes_config_and_keeps_board() {
        let dir = tempfile::tempdir().unwrap();
        let board = dir.path().join("TASKS.md");
        std::fs::write(&board, "## mine\n- [ ] keep me\n").unwrap();

        let args = InitArgs {
            force: false,
            path: dir.path().to_path_buf(),
        };
        execute(args, true).await.unwrap();

        let yaml = std::fs::read_to_string(dir.path().join(".drover/config.yaml")).unwrap();
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.board_path, "TASKS.md");
        assert_eq!(std::fs::read_to_string(&board).unwrap(), "## mine\n- [ ] keep me\n");
        assert!(dir.path().join(".drover/executions").is_dir());
    }
}
