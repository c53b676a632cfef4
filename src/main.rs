//! RelayBridge - TCP to serial/TCP byte relay
//!
//! Runs a single relay session: connect both sides, forward bytes until the
//! session deadline or a disconnect, report the outcome and exit.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

use relaybridge::{
    config::{CliOverrides, ConfigManager, ConnectionType},
    relay::wait_for_outcome,
    report::{sinks_from_config, LogBuffer},
    shutdown::{wait_for_signal, ShutdownSettings, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_SUCCESS},
    Config, RelayService, ShutdownOrchestrator,
};

const DEFAULT_LOG_BUFFER: usize = 1000;

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// CLI arguments for RelayBridge
#[derive(Parser, Debug)]
#[command(name = "relaybridge")]
#[command(about = "RelayBridge - TCP to serial/TCP byte relay")]
#[command(version)]
#[command(long_about = "
RelayBridge - TCP to serial/TCP byte relay

Connects a TCP endpoint to a serial port (or a second TCP endpoint), relays
bytes in both directions for one polling session and exits. The session
succeeds when at least one byte crossed the bridge before the relay timeout.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  RELAYBRIDGE_CONNECTION_TYPE     - serial or tcp
  RELAYBRIDGE_TCP_HOST            - Primary TCP host
  RELAYBRIDGE_TCP_PORT            - Primary TCP port
  RELAYBRIDGE_SERIAL_PATH         - Serial device path
  RELAYBRIDGE_SERIAL_BAUD         - Serial baud rate
  RELAYBRIDGE_SECONDARY_TCP_HOST  - Secondary TCP host
  RELAYBRIDGE_SECONDARY_TCP_PORT  - Secondary TCP port
  RELAYBRIDGE_MAX_RETRIES         - Connect attempts per client
  RELAYBRIDGE_RELAY_TIMEOUT       - Session deadline (e.g., 30s)
  RELAYBRIDGE_CONNECTION_TIMEOUT  - Per-attempt connect timeout (e.g., 10s)
  RELAYBRIDGE_LOG_LEVEL           - Log level (trace, debug, info, warn, error)
  RELAYBRIDGE_STATUS_URL          - Enables status reporting to this URL

Exit codes: 0 session finished (including timeout), 1 startup failure,
2 configuration error.
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "relaybridge.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Secondary transport (overrides config file)
    #[arg(long, help = "Secondary transport: serial or tcp")]
    pub connection_type: Option<ConnectionType>,

    #[arg(long, help = "Primary TCP host")]
    pub tcp_host: Option<String>,

    #[arg(long, help = "Primary TCP port")]
    pub tcp_port: Option<u16>,

    #[arg(long, help = "Serial device path (e.g., /dev/ttyUSB0)")]
    pub serial_path: Option<String>,

    #[arg(long, help = "Serial baud rate")]
    pub baud_rate: Option<u32>,

    /// Relay timeout in seconds
    #[arg(long, help = "Session deadline in seconds")]
    pub relay_timeout: Option<u64>,

    #[arg(long, help = "Log hex/ascii previews of relayed data")]
    pub log_data: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level (defaults to the config file's logging.level)")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            connection_type: self.connection_type,
            tcp_host: self.tcp_host.clone(),
            tcp_port: self.tcp_port,
            serial_path: self.serial_path.clone(),
            baud_rate: self.baud_rate,
            relay_timeout_secs: self.relay_timeout,
            log_data_transfers: self.log_data,
        }
    }

    /// Level requested on the command line, if any
    fn requested_level(&self) -> Option<&str> {
        if self.verbose {
            Some("debug")
        } else {
            self.log_level.as_deref()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = CliArgs::parse();
    let log_buffer = LogBuffer::new(DEFAULT_LOG_BUFFER);

    let filter_handle = match init_tracing(&args, log_buffer.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    std::panic::set_hook(Box::new(|panic| {
        error!("Unhandled panic: {}", panic);
        std::process::exit(EXIT_FAILURE);
    }));

    info!("Starting RelayBridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    apply_logging_config(&args, &config, &filter_handle, &log_buffer);

    if args.validate_config {
        log_config_summary(&config);
        info!("Configuration is valid");
        return;
    }

    let exit_code = run(config, log_buffer).await;
    std::process::exit(exit_code);
}

/// Load configuration with priority: CLI args > config file > environment > defaults
fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&args.overrides());
    config
        .validate()
        .context("Final configuration validation failed")?;

    Ok(config)
}

/// Run one relay session and shut down; returns the exit code
async fn run(config: Config, log_buffer: LogBuffer) -> i32 {
    let mut orchestrator = ShutdownOrchestrator::new(ShutdownSettings::from_config(&config));
    match sinks_from_config(&config.reporting) {
        Ok((status_sink, log_sink)) => {
            if let Some(sink) = status_sink {
                orchestrator = orchestrator.with_status_sink(sink);
            }
            if let Some(sink) = log_sink {
                orchestrator = orchestrator.with_log_sink(sink, log_buffer);
            }
        }
        Err(e) => warn!("Reporting disabled: {}", e),
    }
    let orchestrator = Arc::new(orchestrator);

    let relay = match RelayService::from_config(&config) {
        Ok(relay) => relay,
        Err(e) => {
            error!("Invalid relay configuration: {}", e);
            let reason = format!("configuration error: {e}");
            return orchestrator
                .shutdown(false, &reason, EXIT_CONFIG_ERROR)
                .await
                .exit_code;
        }
    };
    orchestrator.attach_relay(relay.clone());
    let events = relay.subscribe();

    let signal = async {
        match wait_for_signal().await {
            Ok(name) => name,
            Err(e) => {
                error!("Failed to listen for shutdown signals: {}", e);
                std::future::pending().await
            }
        }
    };
    tokio::pin!(signal);

    tokio::select! {
        started = relay.start() => {
            if let Err(e) = started {
                error!("Failed to start relay: {}", e);
                let reason = format!("failed to start relay: {e}");
                return orchestrator.shutdown(false, &reason, EXIT_FAILURE).await.exit_code;
            }
        }
        name = &mut signal => {
            let reason = format!("received {name} before the relay started");
            return orchestrator.shutdown(false, &reason, EXIT_SUCCESS).await.exit_code;
        }
    }

    info!("Relay running, press Ctrl+C or send SIGTERM/SIGINT to stop early");

    let (success, reason) = tokio::select! {
        outcome = wait_for_outcome(events) => match outcome {
            Some(outcome) => (outcome.success(), outcome.reason().to_string()),
            None => (relay.data_relayed(), "relay event stream closed".to_string()),
        },
        name = &mut signal => (relay.data_relayed(), format!("received {name}")),
    };

    orchestrator
        .shutdown(success, &reason, EXIT_SUCCESS)
        .await
        .exit_code
}

fn log_config_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Primary TCP: {}:{}", config.tcp.host, config.tcp.port);
    match config.connection_type {
        ConnectionType::Serial => info!(
            "  Serial: {} {} baud, {} data bits, {} parity, {} stop bits",
            config.serial.path,
            config.serial.baud_rate,
            config.serial.data_bits,
            config.serial.parity,
            config.serial.stop_bits
        ),
        ConnectionType::Tcp => info!(
            "  Secondary TCP: {}:{}",
            config.secondary_tcp.host, config.secondary_tcp.port
        ),
    }
    info!(
        "  Retries: {} (delay {:?}, max {:?})",
        config.retry.max_retries, config.retry.retry_delay, config.retry.max_delay
    );
    info!(
        "  Connection timeout: {:?}, relay timeout: {:?}",
        config.relay.connection_timeout, config.relay.relay_timeout
    );
    info!(
        "  Reporting: {}",
        if config.reporting.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, log_buffer: LogBuffer) -> Result<FilterHandle> {
    let level = args.requested_level().unwrap_or("info");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(true),
        )
        .with(log_buffer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(handle)
}

/// Switch to the configured level unless RUST_LOG or the CLI already chose one
fn apply_logging_config(args: &CliArgs, config: &Config, handle: &FilterHandle, log_buffer: &LogBuffer) {
    log_buffer.set_capacity(config.logging.buffer_capacity);

    if args.requested_level().is_some() || std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
        return;
    }

    if let Err(e) = handle.reload(EnvFilter::new(&config.logging.level)) {
        warn!("Failed to apply log level {}: {}", config.logging.level, e);
    }
}
