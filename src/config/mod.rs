//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `kframe` binary)
//!
//! The file-level [`Config`] is converted into a [`ConnectionConfig`] with
//! typed durations before it reaches the connection engine.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KFrameError, Result};
use crate::protocol::Suite;

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_KEEPALIVE_MS: u64 = 2000;
/// Default reconnection budget.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default base timeout in milliseconds; the handshake gets twice this.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Accepted heartbeat intervals in milliseconds.
pub const KEEPALIVE_RANGE_MS: RangeInclusive<u64> = 500..=10_000;
/// Accepted reconnection budgets.
pub const MAX_RETRIES_RANGE: RangeInclusive<u32> = 1..=20;
/// Accepted base timeouts in milliseconds.
pub const TIMEOUT_RANGE_MS: RangeInclusive<u64> = 100..=60_000;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device addressing
    #[serde(default)]
    pub device: DeviceConfig,

    /// Keepalive and retry policy
    #[serde(default)]
    pub session: SessionConfig,

    /// UDP ports
    #[serde(default)]
    pub ports: PortConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| KFrameError::Config(format!("Failed to read config file: {e}")))?;

        Ok(toml::from_str(&content)?)
    }

    /// Default config file location (`<config_dir>/kframe/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kframe").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `KFRAME_*` environment overrides on top of this config
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("KFRAME_HOST") {
            self.device.host = host;
        }
        if let Ok(suite) = std::env::var("KFRAME_SUITE") {
            match suite.parse() {
                Ok(suite) => self.device.suite = suite,
                Err(e) => tracing::warn!("Ignoring KFRAME_SUITE: {}", e),
            }
        }
        if let Ok(val) = std::env::var("KFRAME_KEEPALIVE_MS") {
            if let Ok(val) = val.parse() {
                self.session.keepalive_interval_ms = val;
            }
        }
        if let Ok(val) = std::env::var("KFRAME_MAX_RETRIES") {
            if let Ok(val) = val.parse() {
                self.session.max_retries = val;
            }
        }
        self
    }

    /// Check values against the ranges the device tolerates
    pub fn validate(&self) -> Result<()> {
        if self.device.host.trim().is_empty() {
            return Err(KFrameError::Config("No host configured".to_string()));
        }
        self.session.validate()
    }

    /// Typed connection parameters for the engine
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.device.host.clone(),
            suite: self.device.suite,
            keepalive_interval: Duration::from_millis(self.session.keepalive_interval_ms),
            max_retries: self.session.max_retries,
            timeout: Duration::from_millis(self.session.timeout_ms),
            ports: self.ports.clone(),
        }
    }
}

/// Device addressing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device IP address or hostname
    #[serde(default)]
    pub host: String,

    /// Suite selected after every successful handshake
    #[serde(default)]
    pub suite: Suite,
}

/// Keepalive and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Heartbeat interval, also the reconnect backoff
    pub keepalive_interval_ms: u64,

    /// Reconnection attempts before giving up
    pub max_retries: u32,

    /// Base timeout; the whole handshake must finish within twice this
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: DEFAULT_KEEPALIVE_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Keepalive must be 500-10000 ms, retries 1-20, timeout 100-60000 ms
    pub fn validate(&self) -> Result<()> {
        check_ranges(self.keepalive_interval_ms, self.max_retries, self.timeout_ms)
    }
}

fn check_ranges(keepalive_ms: u64, max_retries: u32, timeout_ms: u64) -> Result<()> {
    if !KEEPALIVE_RANGE_MS.contains(&keepalive_ms) {
        return Err(KFrameError::Config(format!(
            "keepalive_interval_ms {keepalive_ms} out of range 500-10000"
        )));
    }
    if !MAX_RETRIES_RANGE.contains(&max_retries) {
        return Err(KFrameError::Config(format!(
            "max_retries {max_retries} out of range 1-20"
        )));
    }
    if !TIMEOUT_RANGE_MS.contains(&timeout_ms) {
        return Err(KFrameError::Config(format!(
            "timeout_ms {timeout_ms} out of range 100-60000"
        )));
    }
    Ok(())
}

/// UDP port assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Local address both sockets bind to
    pub bind_host: String,
    /// Local main socket (handshake, commands, heartbeats)
    pub local_main: u16,
    /// Local listener socket (port announcement only)
    pub local_listener: u16,
    /// Device Phase 1 port
    pub remote_initial: u16,
    /// Device port-announcement port
    pub remote_announce: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            local_main: 6130,
            local_listener: 6131,
            remote_initial: 5000,
            remote_announce: 5001,
        }
    }
}

/// Runtime connection parameters consumed by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Device host
    pub host: String,
    /// Suite sent after the handshake
    pub suite: Suite,
    /// Heartbeat interval and reconnect backoff
    pub keepalive_interval: Duration,
    /// Reconnection budget
    pub max_retries: u32,
    /// Base timeout
    pub timeout: Duration,
    /// Port assignment
    pub ports: PortConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Config::default().connection()
    }
}

impl ConnectionConfig {
    /// Create with a host and defaults for everything else
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Set keepalive interval
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set reconnection budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set suite
    pub fn with_suite(mut self, suite: Suite) -> Self {
        self.suite = suite;
        self
    }

    /// Set base timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set port assignment
    pub fn with_ports(mut self, ports: PortConfig) -> Self {
        self.ports = ports;
        self
    }

    /// Check durations and retries against the accepted ranges.
    ///
    /// The engine refuses to run with a configuration that fails this.
    pub fn validate(&self) -> Result<()> {
        check_ranges(
            u64::try_from(self.keepalive_interval.as_millis()).unwrap_or(u64::MAX),
            self.max_retries,
            u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        )
    }

    /// Overall handshake deadline, measured from socket open
    pub fn handshake_timeout(&self) -> Duration {
        self.timeout * 2
    }

    /// Heartbeat watchdog: 2.5 x keepalive
    pub fn heartbeat_timeout(&self) -> Duration {
        self.keepalive_interval.mul_f64(2.5)
    }
}
