//! Worker adapters.

pub mod claude_code;
pub mod mock;

pub use claude_code::{ClaudeCodeConfig, ClaudeCodeWorker};
pub use mock::{MockResponse, MockWorker, RecordedInvocation};
