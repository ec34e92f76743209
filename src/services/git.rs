//! Thin async wrapper over the `git` CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};

/// Runs git commands against one repository.
#[derive(Debug, Clone)]
pub struct Git {
    repo: PathBuf,
}

impl Git {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Run `git <args>` in the repository root and return trimmed stdout.
    pub async fn run(&self, args: &[&str]) -> DomainResult<String> {
        run_in(&self.repo, args).await
    }

    /// Run `git <args>` in the repository root and report only success.
    pub async fn succeeds(&self, args: &[&str]) -> bool {
        succeeds_in(&self.repo, args).await
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        self.succeeds(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await
    }
}

/// Run `git <args>` inside `dir` and return trimmed stdout.
pub async fn run_in(dir: &Path, args: &[&str]) -> DomainResult<String> {
    debug!(dir = %dir.display(), args = ?args, "running git");
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| DomainError::Git(format!("failed to run git {}: {e}", args.join(" "))))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DomainError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub async fn succeeds_in(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .current_dir(dir)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Current `HEAD` commit of the checkout at `dir`.
pub async fn head_commit(dir: &Path) -> DomainResult<String> {
    run_in(dir, &["rev-parse", "HEAD"]).await
}

/// Whether the checkout at `dir` has uncommitted or untracked changes.
pub async fn has_changes(dir: &Path) -> DomainResult<bool> {
    Ok(!run_in(dir, &["status", "--porcelain"]).await?.is_empty())
}

/// Stage everything and commit it; `None` when there was nothing to commit.
pub async fn commit_all(dir: &Path, message: &str) -> DomainResult<Option<String>> {
    if !has_changes(dir).await? {
        return Ok(None);
    }
    run_in(dir, &["add", "-A"]).await?;

    let mut args: Vec<&str> = Vec::new();
    if !succeeds_in(dir, &["config", "user.email"]).await {
        warn!(dir = %dir.display(), "no git identity configured, committing as drover");
        args.extend(["-c", "user.name=drover", "-c", "user.email=drover@localhost"]);
    }
    args.extend(["commit", "--no-verify", "-m", message]);
    run_in(dir, &args).await?;

    head_commit(dir).await.map(Some)
}

/// Paths changed by `commit` relative to its parent.
pub async fn files_in_commit(dir: &Path, commit: &str) -> DomainResult<Vec<String>> {
    let out = run_in(dir, &["diff-tree", "--no-commit-id", "--name-only", "-r", commit]).await?;
    Ok(out.lines().map(str::to_string).collect())
}

/// Commits reachable from `HEAD` but not from `base`, newest first, as
/// `(sha, subject)` pairs.
pub async fn commits_since(dir: &Path, base: &str) -> DomainResult<Vec<(String, String)>> {
    let range = format!("{base}..HEAD");
    let out = run_in(dir, &["log", "--format=%H %s", &range]).await?;
    Ok(out
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split_once(' ').unwrap_or((line, "")))
        .map(|(sha, subject)| (sha.to_string(), subject.to_string()))
        .collect())
}

/// Add `pattern` to the repository-wide exclude file of the checkout at `dir`.
pub async fn exclude(dir: &Path, pattern: &str) -> DomainResult<()> {
    let common = run_in(dir, &["rev-parse", "--git-common-dir"]).await?;
    let common = Path::new(&common);
    let common = if common.is_absolute() {
        common.to_path_buf()
    } else {
        dir.join(common)
    };
    let info_dir = common.join("info");
    tokio::fs::create_dir_all(&info_dir).await?;
    let exclude_path = info_dir.join("exclude");

    let existing = match tokio::fs::read_to_string(&exclude_path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };
    if existing.lines().any(|line| line.trim() == pattern) {
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(pattern);
    updated.push('\n');
    tokio::fs::write(&exclude_path, updated).await?;
    Ok(())
}

/// Discard every change back to `commit`, including untracked files.
pub async fn reset_hard(dir: &Path, commit: &str) -> DomainResult<()> {
    run_in(dir, &["reset", "--hard", commit]).await?;
    run_in(dir, &["clean", "-fd"]).await?;
    Ok(())
}
