use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrent: {0}. Must be between 1 and 64")]
    InvalidMaxConcurrent(usize),

    #[error("Invalid max_dispatch_per_cycle: {0}. Must be at least 1")]
    InvalidDispatchPerCycle(usize),

    #[error("Invalid port_pool_size: {0}. Must be at least 1")]
    InvalidPoolSize(u16),

    #[error("Port range {base}..{end} does not fit below 65536")]
    PortRangeOverflow { base: u16, end: u32 },

    #[error("Primary and secondary port ranges overlap ({primary} and {secondary}, pool size {size})")]
    OverlappingPorts { primary: u16, secondary: u16, size: u16 },

    #[error("Worker phases cannot be empty")]
    EmptyPhases,

    #[error("Prompt template must reference {{task}}")]
    InvalidPromptTemplate,

    #[error("Invalid worker kind: {0}. Must be one of: claude_code, mock")]
    InvalidWorkerKind(String),

    #[error("Invalid max_attempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must not exceed max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .drover/config.yaml (project config, created by init)
    /// 3. .drover/local.yaml (project local overrides, optional)
    /// 4. Environment variables (DROVER_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment(Figment::new().merge(Yaml::file(".drover/config.yaml")))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honoring local and env overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Self::figment(Figment::new().merge(Yaml::file(path.as_ref())))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(project: Figment) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(project)
            .merge(Yaml::file(".drover/local.yaml"))
            .merge(Env::prefixed("DROVER_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let daemon = &config.daemon;
        if daemon.max_concurrent == 0 || daemon.max_concurrent > 64 {
            return Err(ConfigError::InvalidMaxConcurrent(daemon.max_concurrent));
        }
        if daemon.max_dispatch_per_cycle == 0 {
            return Err(ConfigError::InvalidDispatchPerCycle(
                daemon.max_dispatch_per_cycle,
            ));
        }

        let isolation = &config.isolation;
        let size = isolation.port_pool_size;
        if size == 0 {
            return Err(ConfigError::InvalidPoolSize(size));
        }
        for base in [isolation.primary_port_base, isolation.secondary_port_base] {
            let end = u32::from(base) + u32::from(size);
            if end > 65_536 {
                return Err(ConfigError::PortRangeOverflow { base, end });
            }
        }
        let (low, high) = if isolation.primary_port_base <= isolation.secondary_port_base {
            (isolation.primary_port_base, isolation.secondary_port_base)
        } else {
            (isolation.secondary_port_base, isolation.primary_port_base)
        };
        if u32::from(low) + u32::from(size) > u32::from(high) {
            return Err(ConfigError::OverlappingPorts {
                primary: isolation.primary_port_base,
                secondary: isolation.secondary_port_base,
                size,
            });
        }
        if isolation.branch_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "isolation.branch_prefix cannot be empty".to_string(),
            ));
        }

        let worker = &config.worker;
        if worker.phases.is_empty() || worker.phases.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::EmptyPhases);
        }
        if !worker.prompt_template.contains("{task}") {
            return Err(ConfigError::InvalidPromptTemplate);
        }
        if !["claude_code", "mock"].contains(&worker.kind.as_str()) {
            return Err(ConfigError::InvalidWorkerKind(worker.kind.clone()));
        }
        if worker.phase_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker.phase_timeout_secs must be positive".to_string(),
            ));
        }

        if config.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(config.retry.max_attempts));
        }
        if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        if config.board_path.trim().is_empty() || config.state_dir.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "board_path and state_dir cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
