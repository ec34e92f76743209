//! Git worktree workspaces.
//!
//! One worktree per workspace slug, on branch `<prefix>/<slug>`, rooted at
//! `<worktree_dir>/<slug>`. Workspaces outlive executions: later tasks of
//! the same group continue on the same branch.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, instrument, warn};

use crate::services::git::{self, Git};
use crate::domain::errors::{DomainError, DomainResult};

/// A ready-to-use workspace checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub slug: String,
    pub path: PathBuf,
    pub branch: String,
    /// Whether an existing worktree was picked up
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: Git,
    worktree_dir: PathBuf,
    branch_prefix: String,
    base_ref: String,
    sparse_paths: Vec<String>,
}

impl WorkspaceManager {
    pub fn new(repo_root: impl Into<PathBuf>, worktree_dir: impl AsRef<Path>) -> Self {
        let repo_root = repo_root.into();
        let worktree_dir = if worktree_dir.as_ref().is_absolute() {
            worktree_dir.as_ref().to_path_buf()
        } else {
            repo_root.join(worktree_dir)
        };
        Self {
            git: Git::new(repo_root),
            worktree_dir,
            branch_prefix: "drover".to_string(),
            base_ref: "HEAD".to_string(),
            sparse_paths: Vec::new(),
        }
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = base_ref.into();
        self
    }

    pub fn with_sparse_paths(mut self, paths: Vec<String>) -> Self {
        self.sparse_paths = paths;
        self
    }

    pub fn path_for(&self, slug: &str) -> PathBuf {
        self.worktree_dir.join(slug)
    }

    pub fn branch_for(&self, slug: &str) -> String {
        format!("{}/{}", self.branch_prefix, slug)
    }

    /// Create the workspace for `slug`, or reuse a valid existing one.
    #[instrument(skip(self))]
    pub async fn ensure(&self, slug: &str) -> DomainResult<Workspace> {
        let path = self.path_for(slug);
        let branch = self.branch_for(slug);

        if self.is_valid_worktree(&path).await? {
            warn!(
                workspace = slug,
                path = %path.display(),
                "Valid worktree already exists, reusing"
            );
            return Ok(Workspace {
                slug: slug.to_string(),
                path,
                branch,
                reused: true,
            });
        }

        tokio::fs::create_dir_all(&self.worktree_dir).await?;
        self.exclude_worktree_dir().await;

        let path_arg = path.to_string_lossy().to_string();
        let result = if self.git.branch_exists(&branch).await {
            info!(branch = %branch, "Branch already exists, attaching worktree");
            self.git
                .run(&["worktree", "add", &path_arg, &branch])
                .await
        } else {
            info!(branch = %branch, base_ref = %self.base_ref, "Creating workspace branch");
            self.git
                .run(&["worktree", "add", "-b", &branch, &path_arg, &self.base_ref])
                .await
        };
        if let Err(err) = result {
            error!(workspace = slug, error = %err, "Failed to create git worktree");
            return Err(err);
        }

        if !self.sparse_paths.is_empty() {
            let mut args = vec!["sparse-checkout", "set", "--no-cone"];
            args.extend(self.sparse_paths.iter().map(String::as_str));
            git::run_in(&path, &args).await?;
            debug!(workspace = slug, patterns = ?self.sparse_paths, "sparse checkout applied");
        }

        info!(workspace = slug, path = %path.display(), "Workspace created");
        Ok(Workspace {
            slug: slug.to_string(),
            path,
            branch,
            reused: false,
        })
    }

    /// Check if a valid git worktree exists at the given path.
    ///
    /// A directory without a `.git` file is leftover debris and is removed.
    pub async fn is_valid_worktree(&self, path: &Path) -> DomainResult<bool> {
        if !path.exists() {
            return Ok(false);
        }

        let git_file = path.join(".git");
        if !git_file.is_file() {
            warn!(
                path = %path.display(),
                "Directory exists but is not a valid worktree (missing .git file)"
            );
            tokio::fs::remove_dir_all(path).await?;
            return Ok(false);
        }

        Ok(git::succeeds_in(path, &["rev-parse", "--git-dir"]).await)
    }

    /// Remove the worktree of `slug`; the branch is kept.
    #[instrument(skip(self))]
    pub async fn remove(&self, slug: &str) -> DomainResult<bool> {
        let path = self.path_for(slug);
        if !path.exists() {
            return Ok(false);
        }
        let path_arg = path.to_string_lossy().to_string();
        if let Err(err) = self.git.run(&["worktree", "remove", &path_arg]).await {
            warn!(path = %path.display(), error = %err, "Failed to remove worktree, trying with --force");
            self.git
                .run(&["worktree", "remove", "--force", &path_arg])
                .await
                .map_err(|e| DomainError::Git(format!("could not remove workspace {slug}: {e}")))?;
        }
        info!(workspace = slug, "Workspace removed");
        Ok(true)
    }

    async fn exclude_worktree_dir(&self) {
        let Ok(relative) = self.worktree_dir.strip_prefix(self.git.repo()) else {
            return;
        };
        let pattern = format!("/{}/", relative.to_string_lossy().trim_end_matches('/'));
        if let Err(err) = git::exclude(self.git.repo(), &pattern).await {
            debug!(error = %err, "could not exclude worktree directory");
        }
    }
}
