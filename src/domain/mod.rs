//! Domain layer for the drover scheduler
//!
//! Core models, the error type and the port traits adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
