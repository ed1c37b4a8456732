//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_secs, option_duration_secs};
use crate::error::ConfigError;

/// Configuration for session management and tunneling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Sessions unused for longer than this are reclaimed
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Whether idle sessions are reclaimed at all
    pub idle_eviction: bool,

    /// How often the reaper scans for idle sessions
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,

    /// First local port tried for tunnel listeners
    pub port_range_start: u16,

    /// Number of ports scanned after `port_range_start`
    pub port_range_limit: u16,

    /// Deadline for establishing the SSH session of a tunnel
    #[serde(with = "duration_secs")]
    pub ssh_connect_timeout: Duration,

    /// Private key used when a tunnel descriptor names none
    pub default_key_path: PathBuf,

    /// Optional deadline for a single query
    #[serde(
        with = "option_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub query_timeout: Option<Duration>,

    /// sslmode appended to URLs that lack one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(180 * 60),
            idle_eviction: true,
            cleanup_interval: Duration::from_secs(60),
            port_range_start: 29168,
            port_range_limit: 500,
            ssh_connect_timeout: Duration::from_secs(10),
            default_key_path: dirs::home_dir()
                .unwrap_or_default()
                .join(".ssh")
                .join("id_rsa"),
            query_timeout: None,
            ssl_mode: None,
        }
    }
}

impl BrokerConfig {
    /// Reject settings the broker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start == 0 {
            return Err(ConfigError::Invalid(
                "port_range_start must be non-zero".to_string(),
            ));
        }
        if self.port_range_start.checked_add(self.port_range_limit).is_none() {
            return Err(ConfigError::Invalid(format!(
                "port range {}+{} exceeds 65535",
                self.port_range_start, self.port_range_limit
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cleanup_interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(10800));
        assert!(config.idle_eviction);
        assert_eq!(config.port_range_start, 29168);
        assert_eq!(config.port_range_limit, 500);
        assert!(config.default_key_path.ends_with(".ssh/id_rsa"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_port_overflow() {
        let config = BrokerConfig {
            port_range_start: 65500,
            port_range_limit: 100,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = BrokerConfig {
            cleanup_interval: Duration::ZERO,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
