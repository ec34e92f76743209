//! CLI command implementations.

pub mod daemon;
pub mod exec;
pub mod init;
pub mod task;
