//! Connection Clients
//!
//! Per-transport clients (primary TCP, serial, secondary TCP) sharing one
//! contract: retried connect, counted sends, bounded idempotent close, and a
//! typed event stream for everything that happens on an open transport.

mod link;
pub mod secondary;
pub mod serial;
pub mod tcp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{Config, ConnectionType};
use crate::error::{ConfigError, ConnectionError, ErrorClass};

pub use secondary::SecondaryTcpClient;
pub use serial::{DataBits, Parity, SerialClient, SerialSettings, StopBits};
pub use tcp::TcpClient;

/// Bytes shown in hex/ascii previews
pub const PREVIEW_LIMIT: usize = 64;

/// Transport variant of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Tcp,
    Serial,
    SecondaryTcp,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientType::Tcp => write!(f, "tcp"),
            ClientType::Serial => write!(f, "serial"),
            ClientType::SecondaryTcp => write!(f, "secondary_tcp"),
        }
    }
}

/// Lifecycle state; a client is always in exactly one of these
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Per-client counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub client_type: ClientType,
    pub endpoint: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    /// Connect attempts across the client's lifetime
    pub attempts: u32,
    pub reconnects: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub last_error: Option<String>,
    /// RFC 3339 timestamp of the last successful connect
    pub connected_at: Option<String>,
}

impl ConnectionStats {
    pub fn new(client_type: ClientType, endpoint: String) -> Self {
        Self {
            client_type,
            endpoint,
            state: ConnectionState::Disconnected,
            connected: false,
            connecting: false,
            attempts: 0,
            reconnects: 0,
            bytes_received: 0,
            bytes_sent: 0,
            last_error: None,
            connected_at: None,
        }
    }
}

/// Hex and printable-ASCII rendering of the head of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPreview {
    pub hex: String,
    pub ascii: String,
    pub truncated: bool,
}

impl DataPreview {
    pub fn new(data: &[u8]) -> Self {
        let head = &data[..data.len().min(PREVIEW_LIMIT)];
        let hex = head
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        let ascii = head
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();

        Self {
            hex,
            ascii,
            truncated: data.len() > PREVIEW_LIMIT,
        }
    }
}

/// Events a client reports about its open transport
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    /// Bytes read from the transport, in arrival order
    Data(Bytes),
    /// Diagnostic record of a completed write
    Sent { bytes: usize, preview: DataPreview },
    Error { class: ErrorClass, message: String },
    /// The transport went away without `close()` being called
    Disconnected { reason: String },
}

/// Common contract of every transport client
#[async_trait]
pub trait ConnectionClient: Send + Sync {
    fn client_type(&self) -> ClientType;

    /// Human readable endpoint, e.g. `10.0.0.5:4001` or `/dev/ttyUSB0@9600`
    fn endpoint(&self) -> String;

    fn state(&self) -> ConnectionState;

    /// Open the transport, retrying transient failures.
    ///
    /// A no-op when the client is already connected or connecting.
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Write `data` to the open transport
    async fn send(&self, data: &[u8]) -> Result<usize, ConnectionError>;

    /// Release the transport. Never fails and is safe to call repeatedly.
    async fn close(&self);

    fn stats(&self) -> ConnectionStats;

    /// Hand out the event receiver; only the first call gets it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>>;
}

/// Build the primary TCP client and the configured secondary client
pub fn build_clients(
    config: &Config,
) -> Result<(Arc<dyn ConnectionClient>, Arc<dyn ConnectionClient>), ConfigError> {
    let primary: Arc<dyn ConnectionClient> = Arc::new(TcpClient::from_config(config));

    let secondary: Arc<dyn ConnectionClient> = match config.connection_type {
        ConnectionType::Serial => Arc::new(SerialClient::from_config(config)?),
        ConnectionType::Tcp => Arc::new(SecondaryTcpClient::from_config(config)),
    };

    Ok((primary, secondary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_renders_hex_and_ascii() {
        let preview = DataPreview::new(b"I20100\r\n\x01");
        assert_eq!(preview.hex, "49 32 30 31 30 30 0D 0A 01");
        assert_eq!(preview.ascii, "I20100...");
        assert!(!preview.truncated);
    }

    #[test]
    fn test_preview_truncates_long_buffers() {
        let data = vec![0x41u8; PREVIEW_LIMIT + 10];
        let preview = DataPreview::new(&data);
        assert_eq!(preview.ascii.len(), PREVIEW_LIMIT);
        assert!(preview.truncated);
    }

    #[test]
    fn test_build_clients_follows_connection_type() {
        let mut config = Config::default();
        config.connection_type = ConnectionType::Tcp;
        let (primary, secondary) = build_clients(&config).unwrap();
        assert_eq!(primary.client_type(), ClientType::Tcp);
        assert_eq!(secondary.client_type(), ClientType::SecondaryTcp);

        config.connection_type = ConnectionType::Serial;
        let (_, secondary) = build_clients(&config).unwrap();
        assert_eq!(secondary.client_type(), ClientType::Serial);
    }

    #[test]
    fn test_build_clients_rejects_bad_serial_framing() {
        let mut config = Config::default();
        config.serial.stop_bits = 3.0;
        assert!(build_clients(&config).is_err());
    }
}
