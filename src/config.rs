//! Configuration module for pingboard.
//!
//! Loads configuration from environment variables with sensible defaults.
//! The resulting value is passed down explicitly; nothing reads it globally.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default TCP port applied to addresses written without one.
pub const DEFAULT_PORT: u16 = 443;

/// Configuration errors.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("probe interval must be at least one second")]
    ZeroInterval,
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Monitoring configuration consumed by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Seconds between probe rounds (default: 60)
    pub interval: u64,
    /// ICMP echo timeout in milliseconds (default: 3000)
    pub ping_timeout: u64,
    /// TCP connect timeout in milliseconds (default: 3000)
    pub tcping_timeout: u64,
    /// Forward DNS timeout in milliseconds (default: 3000)
    pub dns_timeout: u64,
    /// Reverse DNS timeout in milliseconds (default: 3000)
    pub reverse_dns_timeout: u64,
    /// Path to the persisted endpoint list (default: "endpoints.json")
    pub endpoints_path: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: 60,
            ping_timeout: 3000,
            tcping_timeout: 3000,
            dns_timeout: 3000,
            reverse_dns_timeout: 3000,
            endpoints_path: PathBuf::from("endpoints.json"),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGBOARD_INTERVAL`: seconds between rounds (default: 60)
    /// - `PINGBOARD_PING_TIMEOUT`: ICMP timeout in ms (default: 3000)
    /// - `PINGBOARD_TCPING_TIMEOUT`: TCP connect timeout in ms (default: 3000)
    /// - `PINGBOARD_DNS_TIMEOUT`: forward DNS timeout in ms (default: 3000)
    /// - `PINGBOARD_REVERSE_DNS_TIMEOUT`: reverse DNS timeout in ms (default: 3000)
    /// - `PINGBOARD_ENDPOINTS`: endpoint list path (default: "endpoints.json")
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        let numeric = |key: &str, slot: &mut u64| {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => tracing::warn!("Config: ignoring invalid {}={:?}", key, raw),
                }
            }
        };

        numeric("PINGBOARD_INTERVAL", &mut cfg.interval);
        numeric("PINGBOARD_PING_TIMEOUT", &mut cfg.ping_timeout);
        numeric("PINGBOARD_TCPING_TIMEOUT", &mut cfg.tcping_timeout);
        numeric("PINGBOARD_DNS_TIMEOUT", &mut cfg.dns_timeout);
        numeric("PINGBOARD_REVERSE_DNS_TIMEOUT", &mut cfg.reverse_dns_timeout);

        if let Some(path) = lookup("PINGBOARD_ENDPOINTS") {
            cfg.endpoints_path = PathBuf::from(path);
        }

        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        let timeouts = [
            ("ping timeout", self.ping_timeout),
            ("tcping timeout", self.tcping_timeout),
            ("dns timeout", self.dns_timeout),
            ("reverse dns timeout", self.reverse_dns_timeout),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout)
    }

    pub fn tcping_timeout(&self) -> Duration {
        Duration::from_millis(self.tcping_timeout)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout)
    }

    pub fn reverse_dns_timeout(&self) -> Duration {
        Duration::from_millis(self.reverse_dns_timeout)
    }
}
