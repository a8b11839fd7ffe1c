//! Queue configuration, loaded once at startup.
//!
//! ```toml
//! data_dir = "/var/lib/myapp"
//! worker_count = 4
//! poll_interval_ms = 500
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Tasks live under `<data_dir>/async-tasks/`.
    pub data_dir: PathBuf,

    pub worker_count: usize,

    /// Dispatch tick.
    pub poll_interval_ms: u64,

    /// Wall-clock limit per attempt; `None` lets handlers run forever.
    pub task_timeout_ms: Option<u64>,

    pub shutdown_timeout_ms: u64,

    pub manual_retry_poll_ms: u64,

    /// How often the dispatch loop resyncs its caches from `pending/`.
    pub resync_interval_ms: u64,

    /// `None` keeps completed tasks forever.
    pub completed_retention_days: Option<u64>,

    pub cleanup_interval_secs: u64,

    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            worker_count: 4,
            poll_interval_ms: 500,
            task_timeout_ms: Some(60 * 60 * 1000),
            shutdown_timeout_ms: 5 * 60 * 1000,
            manual_retry_poll_ms: 1000,
            resync_interval_ms: 60_000,
            completed_retention_days: Some(40),
            cleanup_interval_secs: 24 * 60 * 60,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl QueueConfig {
    /// Defaults with the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: QueueConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.manual_retry_poll_ms == 0 || self.resync_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "manual_retry_poll_ms and resync_interval_ms must be positive".into(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid("cleanup_interval_secs must be positive".into()));
        }
        if self.task_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("task_timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn manual_retry_poll(&self) -> Duration {
        Duration::from_millis(self.manual_retry_poll_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn completed_retention(&self) -> Option<Duration> {
        self.completed_retention_days
            .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_gives_defaults() {
        let config = QueueConfig::from_toml_str("").unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.retry.to_policy(), RetryPolicy::default());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let config = QueueConfig::from_toml_str(
            r#"
            data_dir = "/srv/app"
            worker_count = 8

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/app"));
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[rstest]
    #[case("worker_count = 0")]
    #[case("poll_interval_ms = 0")]
    #[case("task_timeout_ms = 0")]
    #[case("[retry]\nmax_attempts = 0")]
    #[case("[retry]\nmultiplier = 0.5")]
    #[case("[retry]\nbase_delay_ms = 10\nmax_delay_ms = 5")]
    fn rejects_unusable_values(#[case] content: &str) {
        assert!(matches!(
            QueueConfig::from_toml_str(content),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(
            QueueConfig::from_toml_str("worker_count = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.toml");
        std::fs::write(&path, "worker_count = 2\n").unwrap();

        let config = QueueConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.worker_count, 2);

        let missing = QueueConfig::from_toml_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
