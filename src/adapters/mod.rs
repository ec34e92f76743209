//! Adapters for the filesystem, the worker process and escalation delivery.

pub mod board;
pub mod escalation;
pub mod execution;
pub mod fs_lock;
pub mod workers;

pub use board::FileBoardStore;
pub use escalation::LogEscalationSink;
pub use execution::JsonExecutionStore;
pub use workers::{ClaudeCodeWorker, MockResponse, MockWorker};
