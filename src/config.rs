//! CCM Configuration
//!
//! This module provides the settings that tune how the cluster manager
//! waits on, launches and talks to local Cassandra processes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the configured JVM max heap size
pub const MAX_HEAP_SIZE_ENV: &str = "CCM_MAX_HEAP_SIZE";

/// Environment variable overriding the configured JVM young generation size
pub const HEAP_NEWSIZE_ENV: &str = "CCM_HEAP_NEWSIZE";

/// Main CCM configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CcmConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Log watching configuration
    #[serde(default)]
    pub watch: WatchConfig,

    /// Node shutdown configuration
    #[serde(default)]
    pub stop: StopConfig,

    /// JVM settings handed to the launcher scripts
    #[serde(default)]
    pub jvm: JvmConfig,

    /// Interactive shell session configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

/// Log watching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Sleep between two reads of a log file that had nothing new
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Budget for readiness and gossip patterns to show up
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// Budget for the launcher to write its pid file
    #[serde(default = "default_pidfile_timeout_secs")]
    pub pidfile_timeout_secs: u64,
}

/// Node shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfig {
    /// First sleep of the exponential backoff while waiting for exit
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Number of liveness probes before giving up (each doubles the sleep)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// JVM settings exported to the launcher environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JvmConfig {
    /// MAX_HEAP_SIZE for every node
    #[serde(default = "default_max_heap_size")]
    pub max_heap_size: String,

    /// HEAP_NEWSIZE for every node
    #[serde(default = "default_heap_newsize")]
    pub heap_newsize: String,
}

/// Interactive shell session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Per-read timeout when draining shell output
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_start_timeout_secs() -> u64 {
    600
}

fn default_pidfile_timeout_secs() -> u64 {
    30
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    7
}

fn default_max_heap_size() -> String {
    "500M".to_string()
}

fn default_heap_newsize() -> String {
    "50M".to_string()
}

fn default_read_timeout_ms() -> u64 {
    100
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            start_timeout_secs: default_start_timeout_secs(),
            pidfile_timeout_secs: default_pidfile_timeout_secs(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for JvmConfig {
    fn default() -> Self {
        Self {
            max_heap_size: default_max_heap_size(),
            heap_newsize: default_heap_newsize(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl CcmConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CcmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.watch.poll_interval_ms == 0 {
            return Err(crate::Error::Config("watch.poll_interval_ms must be positive".into()));
        }

        if self.stop.max_attempts == 0 {
            return Err(crate::Error::Config("stop.max_attempts must be positive".into()));
        }

        if self.jvm.max_heap_size.is_empty() || self.jvm.heap_newsize.is_empty() {
            return Err(crate::Error::Config("jvm heap sizes cannot be empty".into()));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => Ok(()),
            other => Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got {}",
                other
            ))),
        }
    }

    /// Get log poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch.poll_interval_ms)
    }

    /// Get readiness timeout as Duration
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.watch.start_timeout_secs)
    }

    /// Get pid file timeout as Duration
    pub fn pidfile_timeout(&self) -> Duration {
        Duration::from_secs(self.watch.pidfile_timeout_secs)
    }

    /// Get the first stop backoff as Duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.stop.initial_backoff_ms)
    }

    /// Get the shell read timeout as Duration
    pub fn session_read_timeout(&self) -> Duration {
        Duration::from_millis(self.session.read_timeout_ms)
    }

    /// MAX_HEAP_SIZE, honouring the environment override
    pub fn max_heap_size(&self) -> String {
        std::env::var(MAX_HEAP_SIZE_ENV).unwrap_or_else(|_| self.jvm.max_heap_size.clone())
    }

    /// HEAP_NEWSIZE, honouring the environment override
    pub fn heap_newsize(&self) -> String {
        std::env::var(HEAP_NEWSIZE_ENV).unwrap_or_else(|_| self.jvm.heap_newsize.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[logging]
level = "debug"
format = "compact"

[watch]
poll_interval_ms = 200
start_timeout_secs = 60

[stop]
max_attempts = 3
"#;

        let config = CcmConfig::from_str(toml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.start_timeout(), Duration::from_secs(60));
        assert_eq!(config.pidfile_timeout(), Duration::from_secs(30));
        assert_eq!(config.stop.max_attempts, 3);
        assert_eq!(config.initial_backoff(), Duration::from_secs(1));
        assert_eq!(config.jvm.max_heap_size, "500M");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CcmConfig::from_str("").unwrap();
        assert_eq!(config.watch.poll_interval_ms, 1000);
        assert_eq!(config.watch.start_timeout_secs, 600);
        assert_eq!(config.stop.max_attempts, 7);
        assert_eq!(config.session.read_timeout_ms, 100);
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let err = CcmConfig::from_str("[watch]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_unknown_format() {
        let err = CcmConfig::from_str("[logging]\nformat = \"json\"\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
