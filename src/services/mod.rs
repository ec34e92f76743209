//! Scheduling, isolation, execution and recovery services.

pub mod daemon;
pub mod executor;
pub mod git;
pub mod isolation;
pub mod recovery;
pub mod task_graph;

pub use daemon::{DaemonStats, DispatchDaemon};
pub use executor::{ExecutionWrapper, PhaseRequest, RetryPolicy};
pub use isolation::{IsolatedContext, IsolationManager};
pub use recovery::RecoveryService;
