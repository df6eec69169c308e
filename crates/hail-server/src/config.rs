//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`hail.toml`, `/etc/hail/hail.toml`, `~/.config/hail/hail.toml`)
//! - Environment variables (`HAIL__PORT`, `HAIL__GATEWAY__BASE_URL`, ...)
//!
//! Environment variables override values from the file.

use anyhow::{Context, Result};
use hail_core::{FanoutLimits, MaintenanceConfig, RouterConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "hail.toml",
    "/etc/hail/hail.toml",
    "~/.config/hail/hail.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Bid timer sweeping and load monitoring.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Location fanout caps.
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Backing store.
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Enable the long-polling fallback.
    #[serde(default = "default_true")]
    pub long_polling: bool,

    /// Path prefix for long-polling endpoints.
    #[serde(default = "default_poll_path")]
    pub poll_path: String,

    /// How long a poll request waits for messages.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Messages buffered per connection before it starts lagging.
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,

    /// Messages queued for a connection before it is disconnected.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Bid timers older than this are evicted by the sweep.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Timer count above which the monitor forces a sweep.
    #[serde(default = "default_force_sweep_threshold")]
    pub force_sweep_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Customers with open requests notified per location update.
    #[serde(default = "default_open_requests")]
    pub open_requests: usize,

    /// Customers notified per fare-context refresh.
    #[serde(default = "default_fare_context")]
    pub fare_context: usize,
}

/// Which gateway implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process store, for local runs.
    #[default]
    Memory,
    /// The platform backend over HTTP.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Base URL of the platform backend.
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_poll_path() -> String {
    "/poll".to_string()
}

fn default_poll_timeout() -> u64 {
    20_000
}

fn default_max_connections() -> usize {
    hail_core::registry::DEFAULT_MAX_CONNECTIONS
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_hub_capacity() -> usize {
    hail_core::channel::DEFAULT_HUB_CAPACITY
}

fn default_outbox_capacity() -> usize {
    hail_core::registry::DEFAULT_OUTBOX_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_sweep_interval() -> u64 {
    10 * 60
}

fn default_max_age() -> u64 {
    60 * 60
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_force_sweep_threshold() -> usize {
    1000
}

fn default_open_requests() -> usize {
    10
}

fn default_fare_context() -> usize {
    50
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:3000/internal/dispatch".to_string()
}

fn default_gateway_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            schedule: ScheduleConfig::default(),
            fanout: FanoutConfig::default(),
            gateway: GatewayConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket: true,
            websocket_path: default_ws_path(),
            long_polling: true,
            poll_path: default_poll_path(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            hub_capacity: default_hub_capacity(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_age_secs: default_max_age(),
            monitor_interval_secs: default_monitor_interval(),
            force_sweep_threshold: default_force_sweep_threshold(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            open_requests: default_open_requests(),
            fare_context: default_fare_context(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            base_url: default_gateway_url(),
            timeout_ms: default_gateway_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                builder = builder.add_source(::config::File::from(path));
                break;
            }
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix("HAIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_connections: self.limits.max_connections,
            outbox_capacity: self.limits.outbox_capacity,
            hub_capacity: self.limits.hub_capacity,
            fanout: FanoutLimits {
                open_requests: self.fanout.open_requests,
                fare_context: self.fanout.fare_context,
            },
        }
    }

    #[must_use]
    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            sweep_interval: Duration::from_secs(self.schedule.sweep_interval_secs),
            max_age: Duration::from_secs(self.schedule.max_age_secs),
            monitor_interval: Duration::from_secs(self.schedule.monitor_interval_secs),
            force_sweep_threshold: self.schedule.force_sweep_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert!(config.transport.websocket);
        assert!(config.transport.long_polling);
        assert_eq!(config.limits.max_connections, 1000);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(25));
        assert_eq!(config.gateway.backend, Backend::Memory);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 5000
            outbox_capacity = 64

            [fanout]
            fare_context = 20

            [gateway]
            backend = "http"
            base_url = "http://backend:3000/dispatch"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 5000);
        assert_eq!(config.gateway.backend, Backend::Http);

        let router = config.router_config();
        assert_eq!(router.outbox_capacity, 64);
        assert_eq!(router.fanout.fare_context, 20);
        assert_eq!(router.fanout.open_requests, 10);
    }

    #[test]
    fn test_maintenance_config() {
        let config: Config = toml::from_str(
            r#"
            [schedule]
            max_age_secs = 1800
            "#,
        )
        .unwrap();

        let maintenance = config.maintenance_config();
        assert_eq!(maintenance.max_age, Duration::from_secs(1800));
        assert_eq!(maintenance.sweep_interval, Duration::from_secs(600));
        assert_eq!(maintenance.force_sweep_threshold, 1000);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("hail-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7001\n[heartbeat]\ntimeout_ms = 1000\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7001);
        assert_eq!(config.heartbeat.timeout(), Duration::from_secs(1));
        assert!(Config::from_file("/nonexistent/hail.toml").is_err());
    }
}
