//! Configuration module for Cirrus.
//!
//! Typed configuration structs that map to the YAML configuration file,
//! with loading, validation, and defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Cirrus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory of the local mirror.
    pub root: PathBuf,
    /// Seconds between remote polling cycles.
    pub poll_interval: u64,
    /// Seconds a local path must stay quiet before its change settles.
    pub debounce_delay: u64,
}

/// Transfer queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum concurrent transfer workers.
    pub concurrency: u32,
    /// Download chunk size (in MiB) when the provider serves ranges.
    pub chunk_size_mb: u64,
    /// Maximum attempts per operation before it is parked as failed.
    pub max_attempts: u32,
    /// Seconds before a single request attempt is treated as a transient
    /// failure.
    pub request_timeout: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cirrus/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cirrus")
            .join("config.yaml")
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Cirrus"),
            poll_interval: 30,
            debounce_delay: 2,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            chunk_size_mb: 4,
            max_attempts: 5,
            request_timeout: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"transfer.concurrency"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.sync.poll_interval == 0 {
            errors.push(ValidationError {
                field: "sync.poll_interval".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }

        if self.transfer.concurrency == 0 {
            errors.push(ValidationError {
                field: "transfer.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.transfer.chunk_size_mb == 0 {
            errors.push(ValidationError {
                field: "transfer.chunk_size_mb".to_string(),
                message: "must be at least 1 MiB".to_string(),
            });
        }

        if self.transfer.max_attempts == 0 {
            errors.push(ValidationError {
                field: "transfer.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.transfer.request_timeout == 0 {
            errors.push(ValidationError {
                field: "transfer.request_timeout".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".to_string(),
                message: format!(
                    "unknown level '{}', expected one of {valid_levels:?}",
                    self.logging.level
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.poll_interval, 30);
        assert_eq!(config.sync.debounce_delay, 2);
        assert_eq!(config.transfer.concurrency, 4);
        assert_eq!(config.transfer.chunk_size_mb, 4);
        assert_eq!(config.transfer.max_attempts, 5);
        assert_eq!(config.transfer.request_timeout, 30);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_load_partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "sync:\n  root: /tmp/mirror\n  poll_interval: 10\ntransfer:\n  concurrency: 2"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sync.root, PathBuf::from("/tmp/mirror"));
        assert_eq!(config.sync.poll_interval, 10);
        assert_eq!(config.sync.debounce_delay, 2);
        assert_eq!(config.transfer.concurrency, 2);
        assert_eq!(config.transfer.max_attempts, 5);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/cirrus.yaml"));
        assert_eq!(config.transfer.concurrency, 4);
    }

    #[test]
    fn test_validate_catches_zeroes() {
        let mut config = Config::default();
        config.sync.poll_interval = 0;
        config.transfer.concurrency = 0;
        config.logging.level = "verbose".to_string();

        let errors = config.validate();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"sync.poll_interval"));
        assert!(fields.contains(&"transfer.concurrency"));
        assert!(fields.contains(&"logging.level"));
    }

    #[test]
    fn test_default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("cirrus/config.yaml"));
    }
}
