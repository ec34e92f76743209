//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - Programmatic defaults
//! - Project YAML files under `.drover/`
//! - `DROVER_*` environment overrides
//! - Validation after merging

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
