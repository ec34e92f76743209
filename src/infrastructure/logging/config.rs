use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::models::LoggingConfig;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console format (json, pretty)
    #[serde(default = "default_format")]
    pub format: LogFormat,

    /// Directory for log files (optional, if None logs only to the console)
    pub log_dir: Option<PathBuf>,

    /// Enable console logging
    #[serde(default = "default_true")]
    pub enable_console: bool,

    /// Log rotation policy
    #[serde(default)]
    pub rotation: RotationPolicy,

    /// Log retention in days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    #[default]
    Daily,
    Hourly,
    Never,
}

impl RotationPolicy {
    /// Number of files that cover `retention_days`.
    pub fn max_files(self, retention_days: u32) -> usize {
        let days = retention_days.max(1) as usize;
        match self {
            Self::Daily => days,
            Self::Hourly => days * 24,
            Self::Never => 1,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            log_dir: None,
            enable_console: true,
            rotation: RotationPolicy::default(),
            retention_days: default_retention_days(),
        }
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            level: config.level.clone(),
            format: if config.format == "json" {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            },
            log_dir: config.log_dir.as_ref().map(PathBuf::from),
            enable_console: true,
            rotation: match config.rotation.as_str() {
                "hourly" => RotationPolicy::Hourly,
                "never" => RotationPolicy::Never,
                _ => RotationPolicy::Daily,
            },
            retention_days: config.retention_days,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_logging_config() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            log_dir: Some("/tmp/drover-logs".to_string()),
            rotation: "hourly".to_string(),
            retention_days: 2,
        };
        let log = LogConfig::from(&config);
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.rotation, RotationPolicy::Hourly);
        assert_eq!(log.log_dir, Some(PathBuf::from("/tmp/drover-logs")));
        assert_eq!(log.rotation.max_files(log.retention_days), 48);
    }
}
