//! Configuration types for dns-monitor.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::MonitorError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agents to monitor.
    #[serde(default)]
    pub servers: ServersConfig,

    /// Connection and reload tuning.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Query API listener.
    #[serde(default)]
    pub http: HttpConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a TOML file, with `DNSMONITOR__` prefixed
    /// environment variables layered on top.
    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("DNSMONITOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would turn the connection or reload loops into
    /// busy loops.
    pub fn validate(&self) -> Result<(), MonitorError> {
        let monitor = &self.monitor;
        for (key, value) in [
            ("monitor.connect_timeout_secs", monitor.connect_timeout_secs),
            ("monitor.read_timeout_secs", monitor.read_timeout_secs),
            ("monitor.reload_interval_secs", monitor.reload_interval_secs),
        ] {
            if value == 0 {
                return Err(MonitorError::Config(format!("{key} must be greater than 0")));
            }
        }
        Ok(())
    }
}

/// Names of the agents to monitor.
///
/// Every reload pass resolves all three lists again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersConfig {
    /// Literal addresses or hostnames.
    #[serde(default)]
    pub a: Vec<String>,

    /// Domains whose NS hosts are monitored.
    #[serde(default)]
    pub domain: Vec<String>,

    /// TXT discovery entries of the form `"<txt name>, <base domain>"`.
    #[serde(default)]
    pub txt: Vec<String>,
}

/// Agent connection and reload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Port agents serve the monitoring WebSocket on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Timeout in seconds for the TCP connect and, separately, the WebSocket upgrade.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Frame read timeout in seconds; a timeout forces a reconnect.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Seconds between configuration reload passes.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Reconnect backoff.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl MonitorConfig {
    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Reload interval as a `Duration`.
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            agent_port: default_agent_port(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            reload_interval_secs: default_reload_interval(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Reconnect backoff: `retries² / 2` seconds, replaced by `cap_secs` once it
/// exceeds `cap_threshold_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay above which the cap applies.
    #[serde(default = "default_cap_threshold")]
    pub cap_threshold_secs: u64,

    /// Delay used once the threshold is exceeded.
    #[serde(default = "default_cap")]
    pub cap_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            cap_threshold_secs: default_cap_threshold(),
            cap_secs: default_cap(),
        }
    }
}

/// HTTP query API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address for the status API to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dns_monitor=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "dns-monitor".to_string()
}

fn default_agent_port() -> u16 {
    8053
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    3
}

fn default_reload_interval() -> u64 {
    20
}

fn default_cap_threshold() -> u64 {
    60
}

fn default_cap() -> u64 {
    30
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2090))
}
