//! Facade configuration.
//!
//! Layered like this, lowest precedence first:
//! 1. Hardcoded defaults
//! 2. TOML file (path from `WAYPOINT_CONFIG`, else `./waypoint.toml` if present)
//! 3. `WAYPOINT_*` environment variables
//!
//! Every layer is validated once at the end.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::constants::DEFAULT_MAX_CONCURRENT_NODE_FETCHES;
use crate::constants::DEFAULT_WATCH_CHANNEL_CAPACITY;
use crate::constants::DEFAULT_WATCH_WAIT_MS;
use crate::constants::MAX_CONCURRENT_NODE_FETCHES;
use crate::constants::MAX_WATCH_CHANNEL_CAPACITY;
use crate::constants::MAX_WATCH_WAIT_MS;
pub use crate::lock::LockConfig;

/// Environment variable naming the config file.
pub const CONFIG_FILE_ENV: &str = "WAYPOINT_CONFIG";

/// Config file tried when `WAYPOINT_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "waypoint.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is invalid
    #[error("invalid configuration for {key}: '{value}' ({reason})")]
    InvalidValue { key: String, value: String, reason: String },
    /// A required configuration value is missing
    #[error("missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },
}

/// Long-poll watch tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// How long the backend may hold each blocking query open.
    pub wait_ms: u64,
    /// Undelivered results buffered per watch before the watcher waits.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            wait_ms: DEFAULT_WATCH_WAIT_MS,
            channel_capacity: DEFAULT_WATCH_CHANNEL_CAPACITY,
        }
    }
}

/// Discovery aggregation tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Per-node catalog fetches kept in flight at once.
    pub max_concurrent_node_fetches: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_node_fetches: DEFAULT_MAX_CONCURRENT_NODE_FETCHES,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypointConfig {
    pub watch: WatchConfig,
    pub discovery: DiscoveryConfig,
    pub lock: LockConfig,
}

impl WaypointConfig {
    /// Load configuration from a TOML file. Missing fields take defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            key: "config_file".to_string(),
            value: path.display().to_string(),
            reason: format!("failed to read file: {e}"),
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::InvalidValue { key, reason, .. } => ConfigError::InvalidValue {
                key,
                value: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::InvalidValue {
            key: "config_file".to_string(),
            value: String::new(),
            reason: format!("failed to parse TOML: {e}"),
        })
    }

    /// Defaults, then the config file if one is found, then environment
    /// overrides, then validation.
    pub fn load_with_layers() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if Path::new(&path).exists() => {
                info!(path = %path, "loading configuration from WAYPOINT_CONFIG");
                Self::from_toml_file(&path)?
            }
            Ok(path) => {
                return Err(ConfigError::InvalidValue {
                    key: CONFIG_FILE_ENV.to_string(),
                    value: path,
                    reason: "file does not exist".to_string(),
                });
            }
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                info!(path = DEFAULT_CONFIG_FILE, "loading configuration");
                Self::from_toml_file(DEFAULT_CONFIG_FILE)?
            }
            Err(_) => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WAYPOINT_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = parse_var(&lookup, "WAYPOINT_WATCH_WAIT_MS")? {
            self.watch.wait_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WAYPOINT_WATCH_CHANNEL_CAPACITY")? {
            self.watch.channel_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "WAYPOINT_MAX_CONCURRENT_NODE_FETCHES")? {
            self.discovery.max_concurrent_node_fetches = v;
        }
        if let Some(v) = parse_var(&lookup, "WAYPOINT_LOCK_TTL_MS")? {
            self.lock.ttl_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WAYPOINT_LOCK_ACQUIRE_TIMEOUT_MS")? {
            self.lock.acquire_timeout_ms = v;
        }
        if let Some(holder) = lookup("WAYPOINT_LOCK_HOLDER_ID") {
            self.lock.holder_id = holder;
        }
        Ok(())
    }

    /// Check bounds. Out-of-range values are errors, not silently clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch.wait_ms == 0 || self.watch.wait_ms > MAX_WATCH_WAIT_MS {
            return Err(invalid("watch.wait_ms", self.watch.wait_ms, format!("must be in 1..={MAX_WATCH_WAIT_MS}")));
        }
        if self.watch.channel_capacity == 0 || self.watch.channel_capacity > MAX_WATCH_CHANNEL_CAPACITY {
            return Err(invalid(
                "watch.channel_capacity",
                self.watch.channel_capacity,
                format!("must be in 1..={MAX_WATCH_CHANNEL_CAPACITY}"),
            ));
        }
        let fetches = self.discovery.max_concurrent_node_fetches;
        if fetches == 0 || fetches > MAX_CONCURRENT_NODE_FETCHES {
            return Err(invalid(
                "discovery.max_concurrent_node_fetches",
                fetches,
                format!("must be in 1..={MAX_CONCURRENT_NODE_FETCHES}"),
            ));
        }
        if self.lock.ttl_ms == 0 {
            return Err(invalid("lock.ttl_ms", self.lock.ttl_ms, "must be positive"));
        }
        if self.lock.initial_backoff_ms > self.lock.max_backoff_ms {
            return Err(invalid(
                "lock.initial_backoff_ms",
                self.lock.initial_backoff_ms,
                "must not exceed lock.max_backoff_ms",
            ));
        }
        if self.lock.holder_id.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "lock.holder_id".to_string(),
                hint: "set WAYPOINT_LOCK_HOLDER_ID or omit it to get a random id".to_string(),
            });
        }
        Ok(())
    }
}

fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| {
            warn!(key, value = %raw, "unparseable configuration override");
            invalid(key, &raw, e.to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = WaypointConfig::default();
        config.validate().unwrap();
        assert_eq!(config.watch.wait_ms, DEFAULT_WATCH_WAIT_MS);
        assert!(!config.lock.holder_id.is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WaypointConfig::from_toml_str(
            r#"
            [watch]
            wait_ms = 2000

            [lock]
            holder_id = "worker-7"
            "#,
        )
        .unwrap();
        assert_eq!(config.watch.wait_ms, 2000);
        assert_eq!(config.watch.channel_capacity, DEFAULT_WATCH_CHANNEL_CAPACITY);
        assert_eq!(config.discovery.max_concurrent_node_fetches, DEFAULT_MAX_CONCURRENT_NODE_FETCHES);
        assert_eq!(config.lock.holder_id, "worker-7");
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[discovery]\nmax_concurrent_node_fetches = 4").unwrap();

        let config = WaypointConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.discovery.max_concurrent_node_fetches, 4);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = WaypointConfig::from_toml_file("/nonexistent/waypoint.toml").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "config_file"));
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let err = WaypointConfig::from_toml_str("[watch\nwait_ms = ").unwrap_err();
        assert!(err.to_string().contains("failed to parse TOML"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = WaypointConfig::default();
        config
            .apply_overrides_from(lookup(&[
                ("WAYPOINT_WATCH_WAIT_MS", "1500"),
                ("WAYPOINT_MAX_CONCURRENT_NODE_FETCHES", " 8 "),
                ("WAYPOINT_LOCK_HOLDER_ID", "svc-a"),
            ]))
            .unwrap();
        assert_eq!(config.watch.wait_ms, 1500);
        assert_eq!(config.discovery.max_concurrent_node_fetches, 8);
        assert_eq!(config.lock.holder_id, "svc-a");
    }

    #[test]
    fn test_unparseable_override_is_error() {
        let mut config = WaypointConfig::default();
        let err = config.apply_overrides_from(lookup(&[("WAYPOINT_LOCK_TTL_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "WAYPOINT_LOCK_TTL_MS"));
    }

    #[test]
    fn test_validate_bounds() {
        let mut config = WaypointConfig::default();
        config.discovery.max_concurrent_node_fetches = 0;
        assert!(config.validate().is_err());

        let mut config = WaypointConfig::default();
        config.watch.wait_ms = MAX_WATCH_WAIT_MS + 1;
        assert!(config.validate().is_err());

        let mut config = WaypointConfig::default();
        config.lock.holder_id.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired { .. })));
    }
}
