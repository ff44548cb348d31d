//! Daemon configuration parsing.
//!
//! The daemon reads a single TOML file covering the snapshot location,
//! the balancer tunables, and the lifecycle timeouts. Every field has a
//! default so an empty file is a valid configuration; validation is
//! fail-closed for the few values that can render the balancer
//! nonsensical.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::{LifecycleSettings, PollBudget};
use crate::memory::BalancerConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Daemon paths and loop timing.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Balancer tunables.
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Lifecycle controller tunables.
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

impl WardenConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a tunable is out of
    /// range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.balancer.cache_factor.is_finite() || self.balancer.cache_factor < 1.0 {
            return Err(ConfigError::Validation(format!(
                "balancer.cache_factor must be a finite value >= 1.0, got {}",
                self.balancer.cache_factor
            )));
        }
        if self.balancer.min_prefmem == 0 {
            return Err(ConfigError::Validation(
                "balancer.min_prefmem must be nonzero".to_string(),
            ));
        }
        if self.daemon.balance_interval.is_zero() {
            return Err(ConfigError::Validation(
                "daemon.balance_interval must be nonzero".to_string(),
            ));
        }
        if self.daemon.admission.attempts == 0 {
            return Err(ConfigError::Validation(
                "daemon.admission.attempts must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Daemon paths and loop timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Registry snapshot path.
    #[serde(default = "default_store_file")]
    pub store_file: PathBuf,

    /// Period of the balancing loop.
    #[serde(default = "default_balance_interval")]
    #[serde(with = "humantime_serde")]
    pub balance_interval: Duration,

    /// Retry budget for memory admission: how long a start may wait for
    /// donors to actually yield memory.
    #[serde(default = "default_admission_budget")]
    pub admission: PollBudget,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_file: default_store_file(),
            balance_interval: default_balance_interval(),
            admission: default_admission_budget(),
        }
    }
}

fn default_store_file() -> PathBuf {
    PathBuf::from("/var/lib/warden/domains.json")
}

const fn default_balance_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_admission_budget() -> PollBudget {
    PollBudget::new(20, Duration::from_millis(100))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A tunable is out of range.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde adapter storing `Duration` as a humantime string ("5s",
/// "200ms").
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config = WardenConfig::from_toml("").unwrap();
        assert_eq!(config.balancer.cache_factor, 1.3);
        assert_eq!(config.balancer.min_prefmem, 200 * 1024 * 1024);
        assert_eq!(config.daemon.balance_interval, Duration::from_secs(5));
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
            [daemon]
            store_file = "/tmp/warden/domains.json"
            balance_interval = "2s"

            [daemon.admission]
            attempts = 10
            interval = "250ms"

            [balancer]
            cache_factor = 1.5
            min_prefmem = 104857600
            squeeze_threshold = 5242880

            [lifecycle]
            timezone = "Europe/Berlin"

            [lifecycle.readiness]
            attempts = 30
            interval = "500ms"
        "#;
        let config = WardenConfig::from_toml(toml).unwrap();
        assert_eq!(config.daemon.store_file, PathBuf::from("/tmp/warden/domains.json"));
        assert_eq!(config.daemon.admission.attempts, 10);
        assert_eq!(config.balancer.cache_factor, 1.5);
        assert_eq!(config.balancer.squeeze_threshold, 5 * 1024 * 1024);
        assert_eq!(config.lifecycle.timezone, "Europe/Berlin");
        assert_eq!(config.lifecycle.readiness.attempts, 30);
    }

    #[test]
    fn cache_factor_below_one_rejected() {
        let toml = r#"
            [balancer]
            cache_factor = 0.5
        "#;
        let err = WardenConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn zero_balance_interval_rejected() {
        let toml = r#"
            [daemon]
            balance_interval = "0s"
        "#;
        let err = WardenConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn round_trip() {
        let config = WardenConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = WardenConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
