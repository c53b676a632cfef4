//! Serial Client
//!
//! Opens the serial line through `tokio-serial`. Framing settings are
//! validated when the client is built, so a bad parity or stop-bit value is
//! reported as a configuration error before any connect attempt.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::link::{establish, Link};
use super::{ClientEvent, ClientType, ConnectionClient, ConnectionState, ConnectionStats};
use crate::config::{Config, SerialConfig};
use crate::error::{classify_io_kind, ConfigError, ConnectionError, ErrorClass};
use crate::retry::{RetryHandler, RetryPolicy};

/// Bound on a graceful serial close before the port handle is dropped
pub const SERIAL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

impl FromStr for Parity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Parity::None),
            "even" => Ok(Parity::Even),
            "odd" => Ok(Parity::Odd),
            "mark" => Ok(Parity::Mark),
            "space" => Ok(Parity::Space),
            _ => Err(ConfigError::InvalidSerialSetting {
                field: "parity",
                value: s.to_string(),
                allowed: "none, even, odd, mark, space",
            }),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
            Parity::Mark => "mark",
            Parity::Space => "space",
        };
        write!(f, "{name}")
    }
}

/// Character size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            _ => Err(ConfigError::InvalidSerialSetting {
                field: "data bits",
                value: value.to_string(),
                allowed: "5, 6, 7, 8",
            }),
        }
    }
}

/// Stop bit count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl TryFrom<f32> for StopBits {
    type Error = ConfigError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        if value == 1.0 {
            Ok(StopBits::One)
        } else if value == 1.5 {
            Ok(StopBits::OnePointFive)
        } else if value == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(ConfigError::InvalidSerialSetting {
                field: "stop bits",
                value: value.to_string(),
                allowed: "1, 1.5, 2",
            })
        }
    }
}

/// Validated serial line settings
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl SerialSettings {
    /// Validate the raw `[serial]` section
    pub fn from_config(config: &SerialConfig) -> Result<Self, ConfigError> {
        if config.path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "serial path",
                reason: "must not be empty".to_string(),
            });
        }

        if config.baud_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "serial baud rate",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            path: config.path.clone(),
            baud_rate: config.baud_rate,
            parity: config.parity.parse()?,
            data_bits: DataBits::try_from(config.data_bits)?,
            stop_bits: StopBits::try_from(config.stop_bits)?,
        })
    }

    /// Map onto the backend's enums. Mark/space parity and 1.5 stop bits
    /// are valid framing but the backend cannot express them.
    fn backend_framing(
        &self,
    ) -> io::Result<(tokio_serial::Parity, tokio_serial::DataBits, tokio_serial::StopBits)> {
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{} parity is not supported by the serial backend", self.parity),
                ))
            }
        };

        let data_bits = match self.data_bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        };

        let stop_bits = match self.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "1.5 stop bits are not supported by the serial backend",
                ))
            }
        };

        Ok((parity, data_bits, stop_bits))
    }
}

/// Classify a serial backend error
pub fn classify_serial(err: &tokio_serial::Error) -> ErrorClass {
    match err.kind() {
        // Missing or busy device nodes come and go with USB adapters
        tokio_serial::ErrorKind::NoDevice => ErrorClass::Retryable,
        tokio_serial::ErrorKind::Io(kind) => classify_io_kind(kind),
        tokio_serial::ErrorKind::InvalidInput => ErrorClass::Fatal,
        tokio_serial::ErrorKind::Unknown => ErrorClass::Unexpected,
    }
}

fn serial_error(err: tokio_serial::Error) -> ConnectionError {
    let class = classify_serial(&err);
    let kind = match err.kind() {
        tokio_serial::ErrorKind::Io(kind) => kind,
        tokio_serial::ErrorKind::NoDevice => io::ErrorKind::NotFound,
        tokio_serial::ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
        tokio_serial::ErrorKind::Unknown => io::ErrorKind::Other,
    };

    ConnectionError::Io {
        client: ClientType::Serial,
        operation: "open",
        class,
        source: io::Error::new(kind, err.description),
    }
}

fn open_port(settings: &SerialSettings) -> Result<SerialStream, ConnectionError> {
    let (parity, data_bits, stop_bits) =
        settings
            .backend_framing()
            .map_err(|source| ConnectionError::Io {
                client: ClientType::Serial,
                operation: "open",
                class: ErrorClass::Fatal,
                source,
            })?;

    debug!("Opening serial port: {}", settings.path);

    #[allow(unused_mut)]
    let mut port = tokio_serial::new(&settings.path, settings.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(serial_error)?;

    #[cfg(unix)]
    port.set_exclusive(false).map_err(serial_error)?;

    Ok(port)
}

/// Client for the serial line
pub struct SerialClient {
    settings: SerialSettings,
    retry: RetryHandler,
    link: Arc<Link<WriteHalf<SerialStream>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl SerialClient {
    /// Create a new serial client; framing is validated here
    pub fn new(config: &SerialConfig, retry: RetryPolicy, log_data: bool) -> Result<Self, ConfigError> {
        let settings = SerialSettings::from_config(config)?;
        let (link, events) = Link::new(
            ClientType::Serial,
            format!("{}@{}", settings.path, settings.baud_rate),
            log_data,
        );

        Ok(Self {
            settings,
            retry: RetryHandler::new(retry),
            link,
            events: Mutex::new(Some(events)),
        })
    }

    /// Create a new serial client from configuration
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            &config.serial,
            RetryPolicy::from_config(&config.retry),
            config.relay.log_data_transfers,
        )
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[async_trait]
impl ConnectionClient for SerialClient {
    fn client_type(&self) -> ClientType {
        ClientType::Serial
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.settings.path, self.settings.baud_rate)
    }

    fn state(&self) -> ConnectionState {
        self.link.state()
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        let settings = &self.settings;
        let connected = establish(&self.link, &self.retry, || async move {
            let port = open_port(settings)?;
            let halves: (ReadHalf<SerialStream>, WriteHalf<SerialStream>) = tokio::io::split(port);
            Ok(halves)
        })
        .await?;

        if connected {
            info!(
                "Serial port {} opened ({} baud, {:?} data bits, {} parity, {:?} stop bits)",
                settings.path,
                settings.baud_rate,
                settings.data_bits,
                settings.parity,
                settings.stop_bits
            );
        }
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.link.write(data, true).await
    }

    async fn close(&self) {
        self.link.close(SERIAL_CLOSE_TIMEOUT).await;
    }

    fn stats(&self) -> ConnectionStats {
        self.link.stats()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial_config() -> SerialConfig {
        SerialConfig {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: "none".to_string(),
            data_bits: 8,
            stop_bits: 1.0,
        }
    }

    #[test]
    fn test_valid_framing_accepted() {
        for parity in ["none", "even", "odd", "mark", "space", "EVEN"] {
            for data_bits in [5, 6, 7, 8] {
                for stop_bits in [1.0, 1.5, 2.0] {
                    let config = SerialConfig {
                        parity: parity.to_string(),
                        data_bits,
                        stop_bits,
                        ..serial_config()
                    };
                    assert!(
                        SerialSettings::from_config(&config).is_ok(),
                        "{parity}/{data_bits}/{stop_bits} should be valid"
                    );
                }
            }
        }
    }

    #[test]
    fn test_invalid_parity_rejected() {
        let config = SerialConfig {
            parity: "sticky".to_string(),
            ..serial_config()
        };
        let err = SerialSettings::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSerialSetting { field: "parity", .. }));
    }

    #[test]
    fn test_invalid_data_bits_rejected() {
        for data_bits in [0, 4, 9] {
            let config = SerialConfig {
                data_bits,
                ..serial_config()
            };
            let err = SerialSettings::from_config(&config).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidSerialSetting { field: "data bits", .. }));
        }
    }

    #[test]
    fn test_invalid_stop_bits_rejected() {
        for stop_bits in [0.0, 1.2, 3.0] {
            let config = SerialConfig {
                stop_bits,
                ..serial_config()
            };
            let err = SerialSettings::from_config(&config).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidSerialSetting { field: "stop bits", .. }));
        }
    }

    #[test]
    fn test_client_construction_validates_before_connecting() {
        let config = SerialConfig {
            parity: "bogus".to_string(),
            ..serial_config()
        };
        assert!(SerialClient::new(&config, RetryPolicy::default(), false).is_err());
    }

    #[test]
    fn test_zero_baud_rejected() {
        let config = SerialConfig {
            baud_rate: 0,
            ..serial_config()
        };
        assert!(matches!(
            SerialSettings::from_config(&config),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_framing_fails_without_retry() {
        let config = SerialConfig {
            path: "/dev/relaybridge-test-does-not-exist".to_string(),
            parity: "mark".to_string(),
            ..serial_config()
        };
        let client = SerialClient::new(&config, RetryPolicy::default(), false).unwrap();

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(client.stats().attempts, 1);
    }
}
