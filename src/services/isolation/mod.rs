//! Isolation manager.
//!
//! Gives every execution its own workspace checkout, a port pair nobody else
//! holds and a scoped environment, and takes the reservations back when the
//! execution ends. Workspaces themselves are only removed on request.

pub mod environment;
pub mod ports;
pub mod workspace;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{slugify, ExecutionId, IsolationConfig, PortPair};
use crate::services::git;

pub use environment::{compose, parse_env_file, render_port_file, EnvLayers};
pub use ports::PortPool;
pub use workspace::{Workspace, WorkspaceManager};

/// Everything a worker needs to run in isolation.
#[derive(Debug, Clone)]
pub struct IsolatedContext {
    pub execution_id: ExecutionId,
    pub workspace: String,
    pub path: PathBuf,
    pub branch: String,
    /// Workspace HEAD at acquisition
    pub base_commit: String,
    pub ports: PortPair,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Reservations {
    ports: PortPool,
    /// workspace slug -> holder
    busy: HashMap<String, ExecutionId>,
}

pub struct IsolationManager {
    workspaces: WorkspaceManager,
    config: IsolationConfig,
    state: Mutex<Reservations>,
    ambient: Option<BTreeMap<String, String>>,
}

impl IsolationManager {
    pub fn new(config: IsolationConfig) -> Self {
        let repo = PathBuf::from(&config.repo_root);
        let repo = std::fs::canonicalize(&repo).unwrap_or(repo);
        let workspaces = WorkspaceManager::new(repo, &config.worktree_dir)
            .with_branch_prefix(config.branch_prefix.clone())
            .with_base_ref(config.base_ref.clone())
            .with_sparse_paths(config.sparse_paths.clone());
        let ports = PortPool::new(
            config.port_pool_size,
            config.primary_port_base,
            config.secondary_port_base,
        );
        Self {
            workspaces,
            config,
            state: Mutex::new(Reservations {
                ports,
                busy: HashMap::new(),
            }),
            ambient: None,
        }
    }

    /// Use `ambient` instead of the process environment as the allow-list source.
    pub fn with_ambient_env(mut self, ambient: BTreeMap<String, String>) -> Self {
        self.ambient = Some(ambient);
        self
    }

    /// Replace the port pool (tests use a pool without the bind check).
    pub fn with_port_pool(mut self, pool: PortPool) -> Self {
        self.state = Mutex::new(Reservations {
            ports: pool,
            busy: HashMap::new(),
        });
        self
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Reserve a workspace and ports for `execution_id` and prepare its environment.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn acquire(
        &self,
        group: &str,
        execution_id: &ExecutionId,
        workspace_override: Option<&str>,
    ) -> DomainResult<IsolatedContext> {
        let slug = slugify(workspace_override.unwrap_or(group));

        let ports = {
            let mut state = self.state.lock().await;
            if let Some(holder) = state.busy.get(&slug) {
                if holder != execution_id {
                    return Err(DomainError::WorkspaceBusy {
                        workspace: slug,
                        holder: holder.to_string(),
                    });
                }
            }
            let ports = state.ports.allocate(execution_id)?;
            state.busy.insert(slug.clone(), execution_id.clone());
            ports
        };

        match self.prepare(&slug, execution_id, ports).await {
            Ok(context) => {
                info!(
                    workspace = %context.workspace,
                    primary_port = ports.primary,
                    secondary_port = ports.secondary,
                    base_commit = %context.base_commit,
                    "isolation acquired"
                );
                Ok(context)
            }
            Err(err) => {
                self.release(execution_id).await;
                Err(err)
            }
        }
    }

    async fn prepare(
        &self,
        slug: &str,
        execution_id: &ExecutionId,
        ports: PortPair,
    ) -> DomainResult<IsolatedContext> {
        let workspace = self.workspaces.ensure(slug).await?;
        let base_commit = git::head_commit(&workspace.path).await?;

        tokio::fs::write(
            workspace.path.join(&self.config.port_file),
            render_port_file(ports),
        )
        .await?;
        if let Err(err) = git::exclude(&workspace.path, &self.config.port_file).await {
            debug!(error = %err, "could not exclude port file");
        }

        let layers = EnvLayers {
            allowlist: &self.config.env_allowlist,
            env_files: &self.config.env_files,
            port_file: &self.config.port_file,
            workspace: &workspace.path,
            ports,
            execution_id,
        };
        let env = match &self.ambient {
            Some(ambient) => compose(ambient.clone(), &layers),
            None => compose(std::env::vars(), &layers),
        };

        Ok(IsolatedContext {
            execution_id: execution_id.clone(),
            workspace: workspace.slug,
            path: workspace.path,
            branch: workspace.branch,
            base_commit,
            ports,
            env,
        })
    }

    /// Drop every reservation held by `execution_id`. Safe to call repeatedly.
    pub async fn release(&self, execution_id: &ExecutionId) {
        let mut state = self.state.lock().await;
        let freed_ports = state.ports.release(execution_id);
        let before = state.busy.len();
        state.busy.retain(|_, holder| holder != execution_id);
        if freed_ports || state.busy.len() != before {
            debug!(execution_id = %execution_id, "isolation released");
        }
    }

    /// Delete a workspace checkout. Refused while an execution holds it.
    pub async fn remove_workspace(&self, name: &str) -> DomainResult<bool> {
        let slug = slugify(name);
        {
            let state = self.state.lock().await;
            if let Some(holder) = state.busy.get(&slug) {
                return Err(DomainError::WorkspaceBusy {
                    workspace: slug,
                    holder: holder.to_string(),
                });
            }
        }
        let removed = self.workspaces.remove(&slug).await?;
        if !removed {
            warn!(workspace = %slug, "no workspace to remove");
        }
        Ok(removed)
    }

    /// Workspace path an execution of `group` would use.
    pub fn workspace_path(&self, group: &str, workspace_override: Option<&str>) -> PathBuf {
        self.workspaces
            .path_for(&slugify(workspace_override.unwrap_or(group)))
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.ports.in_use()
    }
}
