//! Drover - task board scheduler for coding-agent workers
//!
//! Drover watches a plain-text task board, dispatches eligible tasks to an
//! external coding-agent CLI inside isolated git worktrees, and checkpoints,
//! retries, escalates or rolls back the work.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Models, errors and port traits
//! - **Service Layer** (`services`): Task graph, isolation, execution wrapper,
//!   recovery and the dispatch daemon
//! - **Adapter Layer** (`adapters`): Board file, execution store, workers and
//!   escalation sinks
//! - **Infrastructure Layer** (`infrastructure`): Configuration and logging
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use drover::cli::Stores;
//! use drover::infrastructure::config::ConfigLoader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let stores = Stores::open(&config);
//!     // Build a DispatchDaemon over the stores and run it
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::{FileBoardStore, JsonExecutionStore, LogEscalationSink, MockWorker};
pub use domain::models::{
    Config, ExecutionId, ExecutionRecord, ExecutionStatus, Group, Task, TaskStatus,
};
pub use domain::ports::{BoardStore, EscalationSink, ExecutionStore, Worker};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{DispatchDaemon, ExecutionWrapper, IsolationManager, RecoveryService};
