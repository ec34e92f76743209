use serde::{Deserialize, Serialize};

/// Main configuration structure for drover
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Path of the task board, relative to the working directory
    #[serde(default = "default_board_path")]
    pub board_path: String,

    /// Directory for execution records, transcripts and locks
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// How long a board mutation waits for the board lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Dispatch daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Workspace, port and environment isolation
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// Worker process configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Per-phase retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Recovery bounds
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_board_path() -> String {
    "TASKS.md".to_string()
}

fn default_state_dir() -> String {
    ".drover".to_string()
}

const fn default_lock_timeout_ms() -> u64 {
    2_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            board_path: default_board_path(),
            state_dir: default_state_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
            daemon: DaemonConfig::default(),
            isolation: IsolationConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Dispatch daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Maximum number of executions running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of tasks started in one cycle
    #[serde(default = "default_max_dispatch_per_cycle")]
    pub max_dispatch_per_cycle: usize,

    /// Delay between cycles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long shutdown waits for running jobs before aborting them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

const fn default_max_concurrent() -> usize {
    3
}

const fn default_max_dispatch_per_cycle() -> usize {
    2
}

const fn default_poll_interval_ms() -> u64 {
    5_000
}

const fn default_shutdown_grace_ms() -> u64 {
    30_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_dispatch_per_cycle: default_max_dispatch_per_cycle(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Workspace, port and environment isolation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IsolationConfig {
    /// Repository the workspaces are created from
    #[serde(default = "default_repo_root")]
    pub repo_root: String,

    /// Directory holding the worktrees, relative to the repository
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,

    /// Prefix of the per-group branches
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Ref new workspaces branch from
    #[serde(default = "default_base_ref")]
    pub base_ref: String,

    /// Sparse checkout patterns; empty means a full checkout
    #[serde(default)]
    pub sparse_paths: Vec<String>,

    /// Number of port pairs in the pool
    #[serde(default = "default_port_pool_size")]
    pub port_pool_size: u16,

    /// First primary port
    #[serde(default = "default_primary_port_base")]
    pub primary_port_base: u16,

    /// First secondary port
    #[serde(default = "default_secondary_port_base")]
    pub secondary_port_base: u16,

    /// Ambient variables passed through to workers
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,

    /// Env files read from the workspace, in order
    #[serde(default = "default_env_files")]
    pub env_files: Vec<String>,

    /// File the allocated ports are written to inside the workspace
    #[serde(default = "default_port_file")]
    pub port_file: String,
}

fn default_repo_root() -> String {
    ".".to_string()
}

fn default_worktree_dir() -> String {
    ".drover/worktrees".to_string()
}

fn default_branch_prefix() -> String {
    "drover".to_string()
}

fn default_base_ref() -> String {
    "HEAD".to_string()
}

const fn default_port_pool_size() -> u16 {
    15
}

const fn default_primary_port_base() -> u16 {
    4100
}

const fn default_secondary_port_base() -> u16 {
    5100
}

fn default_env_allowlist() -> Vec<String> {
    ["PATH", "HOME", "USER", "LANG", "TERM", "SHELL", "TMPDIR"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_env_files() -> Vec<String> {
    vec![".env".to_string(), ".env.local".to_string()]
}

fn default_port_file() -> String {
    ".env.ports".to_string()
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            worktree_dir: default_worktree_dir(),
            branch_prefix: default_branch_prefix(),
            base_ref: default_base_ref(),
            sparse_paths: vec![],
            port_pool_size: default_port_pool_size(),
            primary_port_base: default_primary_port_base(),
            secondary_port_base: default_secondary_port_base(),
            env_allowlist: default_env_allowlist(),
            env_files: default_env_files(),
            port_file: default_port_file(),
        }
    }
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Worker adapter: claude_code or mock
    #[serde(default = "default_worker_kind")]
    pub kind: String,

    /// Path to the worker CLI executable
    #[serde(default = "default_worker_command")]
    pub command: String,

    /// Extra arguments appended to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Phases every task runs through, in order
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,

    /// Prompt template; `{phase}` and `{task}` are substituted
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,

    /// Per-attempt deadline in seconds
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    /// Model used when a task carries no model tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// How long a cancelled worker gets between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_worker_kind() -> String {
    "claude_code".to_string()
}

fn default_worker_command() -> String {
    "claude".to_string()
}

fn default_phases() -> Vec<String> {
    vec!["implement".to_string(), "verify".to_string()]
}

fn default_prompt_template() -> String {
    "/{phase} {task}".to_string()
}

const fn default_phase_timeout_secs() -> u64 {
    1_800
}

const fn default_kill_grace_ms() -> u64 {
    5_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kind: default_worker_kind(),
            command: default_worker_command(),
            extra_args: vec![],
            phases: default_phases(),
            prompt_template: default_prompt_template(),
            phase_timeout_secs: default_phase_timeout_secs(),
            default_model: None,
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts per phase, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier for timeouts and rate limits
    #[serde(default = "default_slow_multiplier")]
    pub slow_multiplier: u32,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    2_000
}

const fn default_max_backoff_ms() -> u64 {
    120_000
}

const fn default_slow_multiplier() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            slow_multiplier: default_slow_multiplier(),
        }
    }
}

/// Recovery bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Extra rounds of the whole retry policy after a retriable failure.
    ///
    /// The retry policy already retries transient failures, so this is 0
    /// unless a deployment wants more.
    #[serde(default = "default_max_retry_rounds")]
    pub max_retry_rounds: u32,

    /// Re-runs with failure feedback after a fixable failure
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,

    /// Commit partial work as a provisional save-point on failure
    #[serde(default = "default_true")]
    pub preserve_partial: bool,
}

const fn default_max_retry_rounds() -> u32 {
    0
}

const fn default_max_fix_attempts() -> u32 {
    2
}

const fn default_true() -> bool {
    true
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retry_rounds: default_max_retry_rounds(),
            max_fix_attempts: default_max_fix_attempts(),
            preserve_partial: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; console only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Rotation of the log file: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
            retention_days: default_retention_days(),
        }
    }
}
