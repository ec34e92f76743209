pub mod config;
pub mod execution;
pub mod recovery;
pub mod task;
pub mod worker;

pub use config::{
    Config, DaemonConfig, IsolationConfig, LoggingConfig, RecoveryConfig, RetryConfig,
    WorkerConfig,
};
pub use execution::{
    Checkpoint, ErrorEntry, ExecutionId, ExecutionRecord, ExecutionStatus, PortPair,
};
pub use recovery::{EscalationReport, FailureKind, RecoveryAction, SuggestedAction};
pub use task::{
    slugify, Group, Task, TaskPriority, TaskStatus, TaskTag, TransitionCheck, TransitionMeta,
};
pub use worker::{
    ErrorClass, Outcome, WorkerError, WorkerEvent, WorkerExit, WorkerInvocation,
};
