//! Port trait definitions (Hexagonal Architecture)
//!
//! Async traits the adapters implement:
//! - BoardStore: locked reads and line-patching writes of the task board
//! - ExecutionStore: execution records and checkpoints
//! - Worker: one invocation of the external coding agent
//! - EscalationSink: delivery of escalation reports to humans

pub mod board_store;
pub mod escalation_sink;
pub mod execution_store;
pub mod worker;

pub use board_store::BoardStore;
pub use escalation_sink::EscalationSink;
pub use execution_store::ExecutionStore;
pub use worker::Worker;
