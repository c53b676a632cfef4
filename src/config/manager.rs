//! Configuration Manager

use super::{Config, ConnectionType, TcpEndpointConfig};
use crate::connection::SerialSettings;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "RELAYBRIDGE";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::load_from_str(&content)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn load_from_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content).context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Some(kind) = env_var("CONNECTION_TYPE") {
            config.connection_type = kind
                .parse::<ConnectionType>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid {ENV_PREFIX}_CONNECTION_TYPE: {kind}"))?;
        }

        if let Some(host) = env_var("TCP_HOST") {
            config.tcp.host = host;
        }

        if let Some(port) = env_var("TCP_PORT") {
            config.tcp.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid {ENV_PREFIX}_TCP_PORT: {port}"))?;
        }

        if let Some(path) = env_var("SERIAL_PATH") {
            config.serial.path = path;
        }

        if let Some(baud) = env_var("SERIAL_BAUD") {
            config.serial.baud_rate = baud
                .parse::<u32>()
                .with_context(|| format!("Invalid {ENV_PREFIX}_SERIAL_BAUD: {baud}"))?;
        }

        if let Some(host) = env_var("SECONDARY_TCP_HOST") {
            config.secondary_tcp.host = host;
        }

        if let Some(port) = env_var("SECONDARY_TCP_PORT") {
            config.secondary_tcp.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid {ENV_PREFIX}_SECONDARY_TCP_PORT: {port}"))?;
        }

        if let Some(retries) = env_var("MAX_RETRIES") {
            config.retry.max_retries = retries
                .parse::<u32>()
                .with_context(|| format!("Invalid {ENV_PREFIX}_MAX_RETRIES: {retries}"))?;
        }

        if let Some(timeout) = env_var("RELAY_TIMEOUT") {
            config.relay.relay_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {ENV_PREFIX}_RELAY_TIMEOUT: {timeout}"))?;
        }

        if let Some(timeout) = env_var("CONNECTION_TIMEOUT") {
            config.relay.connection_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {ENV_PREFIX}_CONNECTION_TIMEOUT: {timeout}"))?;
        }

        if let Some(level) = env_var("LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Some(url) = env_var("STATUS_URL") {
            config.reporting.enabled = true;
            config.reporting.status_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Values supplied on the command line; `None` leaves the loaded value alone
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub connection_type: Option<ConnectionType>,
    pub tcp_host: Option<String>,
    pub tcp_port: Option<u16>,
    pub serial_path: Option<String>,
    pub baud_rate: Option<u32>,
    pub relay_timeout_secs: Option<u64>,
    pub log_data_transfers: bool,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        Self::validate_endpoint("tcp", &self.tcp)
            .context("Primary TCP configuration validation failed")?;

        match self.connection_type {
            ConnectionType::Serial => {
                SerialSettings::from_config(&self.serial)
                    .context("Serial configuration validation failed")?;
            }
            ConnectionType::Tcp => {
                Self::validate_endpoint("secondary_tcp", &self.secondary_tcp)
                    .context("Secondary TCP configuration validation failed")?;
            }
        }

        self.validate_retry_config()
            .context("Retry configuration validation failed")?;

        self.validate_relay_config()
            .context("Relay configuration validation failed")?;

        self.validate_reporting_config()
            .context("Reporting configuration validation failed")?;

        self.validate_logging_config()
            .context("Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_endpoint(section: &str, endpoint: &TcpEndpointConfig) -> Result<()> {
        if endpoint.host.trim().is_empty() {
            bail!("{}.host must not be empty", section);
        }

        if endpoint.port == 0 {
            bail!("{}.port must be greater than 0", section);
        }

        Ok(())
    }

    fn validate_retry_config(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }

        if self.retry.max_retries > 100 {
            bail!("max_retries cannot exceed 100");
        }

        if self.retry.backoff_factor < 1.0 || !self.retry.backoff_factor.is_finite() {
            bail!("backoff_factor must be a finite number >= 1.0");
        }

        if self.retry.max_delay < self.retry.retry_delay {
            bail!("max_delay must not be shorter than retry_delay");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.connection_timeout.is_zero() {
            bail!("connection_timeout must be greater than 0");
        }

        if self.relay.relay_timeout.is_zero() {
            bail!("relay_timeout must be greater than 0");
        }

        if self.relay.relay_timeout > Duration::from_secs(3600) {
            bail!("relay_timeout cannot exceed 1 hour");
        }

        if self.relay.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }

        Ok(())
    }

    fn validate_reporting_config(&self) -> Result<()> {
        if self.reporting.enabled && self.reporting.status_url.is_none() {
            bail!("status_url is required when reporting is enabled");
        }

        if self.reporting.upload_logs && self.reporting.logs_url.is_none() {
            bail!("logs_url is required when upload_logs is enabled");
        }

        if self.reporting.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(kind) = overrides.connection_type {
            self.connection_type = kind;
            tracing::info!("CLI override: connection type set to {}", kind);
        }

        if let Some(host) = &overrides.tcp_host {
            self.tcp.host = host.clone();
            tracing::info!("CLI override: TCP host set to {}", host);
        }

        if let Some(port) = overrides.tcp_port {
            self.tcp.port = port;
            tracing::info!("CLI override: TCP port set to {}", port);
        }

        if let Some(path) = &overrides.serial_path {
            self.serial.path = path.clone();
            tracing::info!("CLI override: serial path set to {}", path);
        }

        if let Some(baud) = overrides.baud_rate {
            self.serial.baud_rate = baud;
            tracing::info!("CLI override: baud rate set to {}", baud);
        }

        if let Some(secs) = overrides.relay_timeout_secs {
            self.relay.relay_timeout = Duration::from_secs(secs);
            tracing::info!("CLI override: relay timeout set to {}s", secs);
        }

        if overrides.log_data_transfers {
            self.relay.log_data_transfers = true;
            tracing::info!("CLI override: data transfer logging enabled");
        }
    }
}
