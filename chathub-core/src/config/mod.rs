//! Configuration management for the channel hierarchy service
//!
//! Configuration starts from defaults and can be loaded from a TOML file or
//! from `CHATHUB_*` environment variables. Every loader validates the result.

use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Prefix of every environment variable read by [`Config::from_env`]
pub const ENV_PREFIX: &str = "CHATHUB";

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channel tree limits
    pub hierarchy: HierarchyConfig,

    /// Audit trail emission
    pub audit: AuditConfig,

    /// Persistent channel store
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Channel tree limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Maximum depth of a public channel; top-level channels have depth 1
    pub max_channel_depth: usize,
}

/// Audit trail emission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Maximum number of event writes running at once
    pub max_in_flight: usize,

    /// How long shutdown waits for pending events
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

/// Persistent channel store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; a private in-memory database when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// Connection pool size for file-backed databases
    pub pool_size: u32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self { max_channel_depth: 5 }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            pool_size: 8,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

/// Parse `<prefix>_<key>` from `lookup` when it is set
fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}_{}", ENV_PREFIX, key);
    match lookup(&name) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidValue {
            key: name,
            reason: e.to_string(),
        }),
        None => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: CHATHUB_<SECTION>_<KEY>
    /// Example: CHATHUB_HIERARCHY_MAX_CHANNEL_DEPTH=7
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(depth) = parse_var(&lookup, "HIERARCHY_MAX_CHANNEL_DEPTH")? {
            config.hierarchy.max_channel_depth = depth;
        }

        if let Some(max) = parse_var(&lookup, "AUDIT_MAX_IN_FLIGHT")? {
            config.audit.max_in_flight = max;
        }
        if let Some(timeout) = parse_var::<humantime::Duration>(&lookup, "AUDIT_DRAIN_TIMEOUT")? {
            config.audit.drain_timeout = timeout.into();
        }

        if let Some(path) = lookup(&format!("{}_STORE_DATABASE_PATH", ENV_PREFIX)) {
            config.store.database_path = Some(PathBuf::from(path));
        }
        if let Some(size) = parse_var(&lookup, "STORE_POOL_SIZE")? {
            config.store.pool_size = size;
        }

        if let Some(level) = lookup(&format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            config.logging.level = level;
        }
        if let Some(json) = parse_var(&lookup, "LOG_JSON")? {
            config.logging.json_format = json;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hierarchy.max_channel_depth == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_channel_depth must be greater than 0".to_string(),
            ));
        }

        if self.audit.max_in_flight == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_in_flight must be greater than 0".to_string(),
            ));
        }

        if self.store.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if crate::logging::LogLevel::from_str(&self.logging.level).is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hierarchy.max_channel_depth, 5);
        assert_eq!(config.audit.max_in_flight, 64);
        assert!(config.store.database_path.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.hierarchy.max_channel_depth = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.audit.max_in_flight = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.store.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("CHATHUB_HIERARCHY_MAX_CHANNEL_DEPTH", "7"),
            ("CHATHUB_AUDIT_DRAIN_TIMEOUT", "250ms"),
            ("CHATHUB_STORE_DATABASE_PATH", "/tmp/channels.db"),
            ("CHATHUB_LOG_JSON", "true"),
        ]))
        .unwrap();

        assert_eq!(config.hierarchy.max_channel_depth, 7);
        assert_eq!(config.audit.drain_timeout, Duration::from_millis(250));
        assert_eq!(config.store.database_path, Some(PathBuf::from("/tmp/channels.db")));
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let result = Config::from_lookup(lookup(&[("CHATHUB_HIERARCHY_MAX_CHANNEL_DEPTH", "deep")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key, .. }) if key == "CHATHUB_HIERARCHY_MAX_CHANNEL_DEPTH"
        ));

        let result = Config::from_lookup(lookup(&[("CHATHUB_HIERARCHY_MAX_CHANNEL_DEPTH", "0")]));
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chathub.toml");

        let mut config = Config::default();
        config.hierarchy.max_channel_depth = 3;
        config.audit.drain_timeout = Duration::from_secs(2);
        config.save_to_file(&path).unwrap();

        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chathub.toml");
        std::fs::write(&path, "[hierarchy]\nmax_channel_depth = 4\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.hierarchy.max_channel_depth, 4);
        assert_eq!(config.audit, AuditConfig::default());
    }
}
