//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Which transport the primary TCP socket is bridged to
    pub connection_type: ConnectionType,
    /// Primary TCP endpoint (the polling side)
    pub tcp: TcpEndpointConfig,
    pub serial: SerialConfig,
    /// Second TCP endpoint, used when `connection_type = "tcp"`
    pub secondary_tcp: TcpEndpointConfig,
    pub retry: RetryConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
    pub reporting: ReportingConfig,
    pub shutdown: ShutdownConfig,
}

/// Secondary transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Serial,
    Tcp,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Serial => write!(f, "serial"),
            ConnectionType::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(ConnectionType::Serial),
            "tcp" => Ok(ConnectionType::Tcp),
            other => Err(format!(
                "unknown connection type '{}', expected 'serial' or 'tcp'",
                other
            )),
        }
    }
}

/// TCP endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpEndpointConfig {
    pub host: String,
    pub port: u16,
}

/// Serial port configuration.
///
/// Framing values are kept raw here and validated by
/// [`SerialSettings`](crate::connection::SerialSettings).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub parity: String,
    pub data_bits: u8,
    pub stop_bits: f32,
}

/// Retry/backoff configuration for connection attempts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

/// Relay session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bound on each individual connect attempt
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// Session deadline
    #[serde(with = "humantime_serde")]
    pub relay_timeout: Duration,
    /// Liveness probe interval for the secondary TCP client
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub log_data_transfers: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Entries kept in memory for upload at shutdown
    pub buffer_capacity: usize,
}

/// External status/log reporting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub enabled: bool,
    pub status_url: Option<String>,
    pub upload_logs: bool,
    pub logs_url: Option<String>,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Shutdown sequence bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_serde")]
    pub hook_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub resource_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Serial,
            tcp: TcpEndpointConfig {
                host: "127.0.0.1".to_string(),
                port: 10001,
            },
            serial: SerialConfig::default(),
            secondary_tcp: TcpEndpointConfig {
                host: "127.0.0.1".to_string(),
                port: 10002,
            },
            retry: RetryConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
            reporting: ReportingConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for TcpEndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10001,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: "none".to_string(),
            data_bits: 8,
            stop_bits: 1.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            log_data_transfers: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            buffer_capacity: 1000,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            status_url: None,
            upload_logs: false,
            logs_url: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_secs(5),
            resource_timeout: Duration::from_secs(5),
        }
    }
}
