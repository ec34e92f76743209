//! Common test utilities for integration tests
//!
//! Provides throwaway git repositories, a board/config fixture and a daemon
//! wired to the mock worker.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use drover::adapters::{FileBoardStore, JsonExecutionStore, LogEscalationSink, MockWorker};
use drover::domain::models::{Config, ExecutionId, ExecutionRecord, Task};
use drover::domain::ports::{BoardStore, ExecutionStore};
use drover::services::isolation::PortPool;
use drover::services::{DispatchDaemon, IsolationManager};
use tempfile::TempDir;

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Run git in `dir` and return trimmed stdout, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Setup a git repository in a temp directory for testing
///
/// Creates an initialized git repo with one committed file.
/// Returns the TempDir (for lifetime management) and the path to the repo.
pub fn setup_test_git_repo() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir for git repo");
    let path = dir
        .path()
        .canonicalize()
        .expect("Failed to canonicalize temp dir");

    git(&path, &["init", "-q"]);
    git(&path, &["config", "user.email", "test@test.com"]);
    git(&path, &["config", "user.name", "Test User"]);
    std::fs::write(path.join("README.md"), "# test repo\n").expect("Failed to write README");
    git(&path, &["add", "README.md"]);
    git(&path, &["commit", "-q", "-m", "initial commit"]);

    (dir, path)
}

/// Config rooted in `repo` with fast retries.
pub fn test_config(repo: &Path) -> Config {
    let mut config = Config::default();
    config.board_path = repo.join("TASKS.md").to_string_lossy().to_string();
    config.state_dir = repo.join(".drover").to_string_lossy().to_string();
    config.lock_timeout_ms = 2_000;
    config.isolation.repo_root = repo.to_string_lossy().to_string();
    config.isolation.env_allowlist = vec!["PATH".to_string()];
    config.worker.kind = "mock".to_string();
    config.worker.phases = vec!["implement".to_string(), "verify".to_string()];
    config.worker.prompt_template = "/{phase} {task}".to_string();
    config.worker.kill_grace_ms = 200;
    config.retry.max_attempts = 2;
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 20;
    config.retry.slow_multiplier = 1;
    config.daemon.poll_interval_ms = 50;
    config.daemon.shutdown_grace_ms = 500;
    config
}

/// A git repository with a board, stores and config.
pub struct Harness {
    pub _dir: TempDir,
    pub repo: PathBuf,
    pub config: Config,
    pub board: Arc<FileBoardStore>,
    pub store: Arc<JsonExecutionStore>,
}

impl Harness {
    pub fn new(board_text: &str) -> Self {
        Self::with_config(board_text, |_| {})
    }

    pub fn with_config(board_text: &str, tweak: impl FnOnce(&mut Config)) -> Self {
        let (dir, repo) = setup_test_git_repo();
        let mut config = test_config(&repo);
        tweak(&mut config);
        std::fs::write(&config.board_path, board_text).expect("Failed to write board");

        let board = Arc::new(FileBoardStore::new(
            &config.board_path,
            Duration::from_millis(config.lock_timeout_ms),
        ));
        let store = Arc::new(JsonExecutionStore::new(
            Path::new(&config.state_dir).join("executions"),
        ));
        Self {
            _dir: dir,
            repo,
            config,
            board,
            store,
        }
    }

    pub fn isolation(&self) -> Arc<IsolationManager> {
        let pool = PortPool::new(
            self.config.isolation.port_pool_size,
            self.config.isolation.primary_port_base,
            self.config.isolation.secondary_port_base,
        )
        .without_port_check();
        let ambient = BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]);
        Arc::new(
            IsolationManager::new(self.config.isolation.clone())
                .with_port_pool(pool)
                .with_ambient_env(ambient),
        )
    }

    pub fn daemon(&self, worker: Arc<MockWorker>) -> DispatchDaemon {
        DispatchDaemon::new(
            &self.config,
            self.board.clone(),
            self.store.clone(),
            worker,
            Arc::new(LogEscalationSink::new()),
            self.isolation(),
        )
    }

    pub fn board_text(&self) -> String {
        std::fs::read_to_string(&self.config.board_path).expect("Failed to read board")
    }

    pub async fn task(&self, key: &str) -> Task {
        self.board
            .read()
            .await
            .expect("Failed to read board")
            .into_iter()
            .find_map(|g| g.find(key).cloned())
            .unwrap_or_else(|| panic!("task {key} not on the board"))
    }

    pub async fn record_of(&self, key: &str) -> ExecutionRecord {
        let id = self
            .task(key)
            .await
            .execution_id
            .unwrap_or_else(|| panic!("task {key} has no execution id"));
        self.record(&id).await
    }

    pub async fn record(&self, id: &ExecutionId) -> ExecutionRecord {
        self.store
            .load(id)
            .await
            .expect("Failed to load record")
            .unwrap_or_else(|| panic!("no record for {id}"))
    }

    pub fn worktree(&self, group: &str) -> PathBuf {
        self.repo.join(".drover/worktrees").join(group)
    }
}

/// Wait for a condition to be true with timeout
///
/// Polls the predicate every 20ms until it returns true or timeout is reached.
pub async fn wait_for<F>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    false
}
