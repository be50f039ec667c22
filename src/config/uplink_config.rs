//! Uplink Configuration - endpoint, queue, retry and lifecycle tunables
//!
//! Every struct implements `Default` with the values in `defaults`, so a
//! missing config file or a partial one behaves the same as the built-ins.

use super::defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "UPLINK_CONFIG";

/// Config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "uplink.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for the telemetry uplink.
///
/// Load with `UplinkConfig::load()` which searches:
/// 1. `$UPLINK_CONFIG` env var
/// 2. `./uplink.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UplinkConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub motion: MotionConfig,
}

/// Ingestion endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Full URL batches are POSTed to
    pub url: String,
    /// Per-send timeout (ms)
    pub timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: defaults::INGEST_URL.to_string(),
            timeout_ms: defaults::SEND_TIMEOUT_MS,
        }
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Durable queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub path: PathBuf,
    pub capacity: usize,
    pub batch_size: usize,
    pub sync_writes: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::QUEUE_PATH),
            capacity: defaults::QUEUE_CAPACITY,
            batch_size: defaults::BATCH_SIZE,
            sync_writes: defaults::SYNC_WRITES,
        }
    }
}

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            jitter_fraction: defaults::RETRY_JITTER_FRACTION,
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
        }
    }
}

/// Bearer token source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_path: PathBuf::from(defaults::TOKEN_PATH),
        }
    }
}

/// Start/stop behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub shutdown_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Motion derivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub moving_threshold_m: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            moving_threshold_m: defaults::MOVING_THRESHOLD_M,
        }
    }
}

impl UplinkConfig {
    /// Load configuration using the standard search order:
    /// 1. `$UPLINK_CONFIG` environment variable
    /// 2. `./uplink.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded uplink config from UPLINK_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from UPLINK_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "UPLINK_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded uplink config from ./uplink.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./uplink.toml, using defaults");
                }
            }
        }

        info!("No uplink.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, err) => ConfigError::Parse(path.to_path_buf(), err),
            other => other,
        })
    }

    /// Parse and validate a TOML document, warning about unknown keys.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate ranges and cross-field consistency, collecting every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if !(self.endpoint.url.starts_with("http://") || self.endpoint.url.starts_with("https://")) {
            errors.push(format!(
                "endpoint.url ({}) must be an http:// or https:// URL",
                self.endpoint.url
            ));
        }
        if self.endpoint.timeout_ms == 0 {
            errors.push("endpoint.timeout_ms must be > 0".to_string());
        }

        if self.queue.capacity == 0 {
            errors.push("queue.capacity must be > 0".to_string());
        }
        if self.queue.batch_size == 0 {
            errors.push("queue.batch_size must be > 0".to_string());
        }
        if self.queue.batch_size > self.queue.capacity {
            errors.push(format!(
                "queue.batch_size ({}) must not exceed queue.capacity ({})",
                self.queue.batch_size, self.queue.capacity
            ));
        }

        let r = &self.retry;
        if r.base_delay_ms == 0 {
            errors.push("retry.base_delay_ms must be > 0".to_string());
        }
        if r.max_delay_ms < r.base_delay_ms {
            errors.push(format!(
                "retry.max_delay_ms ({}) must be >= retry.base_delay_ms ({})",
                r.max_delay_ms, r.base_delay_ms
            ));
        }
        if !(0.0..=1.0).contains(&r.jitter_fraction) {
            errors.push(format!(
                "retry.jitter_fraction ({:.2}) must be within 0.0-1.0",
                r.jitter_fraction
            ));
        }
        if r.max_attempts == 0 {
            errors.push("retry.max_attempts must be > 0".to_string());
        }

        if self.motion.moving_threshold_m < 0.0 {
            errors.push(format!(
                "motion.moving_threshold_m ({:.1}) cannot be negative",
                self.motion.moving_threshold_m
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),
    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(UplinkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = UplinkConfig::from_toml_str("").unwrap();
        assert_eq!(config, UplinkConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = UplinkConfig::from_toml_str(
            r#"
            [queue]
            capacity = 100
            batch_size = 10

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, defaults::RETRY_BASE_DELAY_MS);
        assert_eq!(config.endpoint.url, defaults::INGEST_URL);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = UplinkConfig::default();
        config.queue.batch_size = 0;
        config.retry.jitter_fraction = 1.5;
        config.endpoint.url = "ftp://example".to_string();

        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_larger_than_capacity_rejected() {
        let mut config = UplinkConfig::default();
        config.queue.capacity = 10;
        config.queue.batch_size = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = UplinkConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = UplinkConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplink.toml");
        std::fs::write(&path, "[endpoint]\ntimeout_ms = 500\n").unwrap();

        let config = UplinkConfig::load_from_file(&path).unwrap();
        assert_eq!(config.endpoint.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_missing_file_is_io_error() {
        let err = UplinkConfig::load_from_file(Path::new("/nonexistent/uplink.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }
}
