//! Primary TCP Client

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::link::{establish, Link};
use super::{ClientEvent, ClientType, ConnectionClient, ConnectionState, ConnectionStats};
use crate::config::{Config, TcpEndpointConfig};
use crate::error::{ConnectionError, ErrorClass};
use crate::retry::{RetryHandler, RetryPolicy};

/// Bound on a graceful TCP close before the socket is dropped
pub const TCP_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Client for the primary (polling side) TCP endpoint
pub struct TcpClient {
    host: String,
    port: u16,
    connect_timeout: Duration,
    retry: RetryHandler,
    link: Arc<Link<OwnedWriteHalf>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl TcpClient {
    /// Create a new TCP client
    pub fn new(
        endpoint: &TcpEndpointConfig,
        connect_timeout: Duration,
        retry: RetryPolicy,
        log_data: bool,
    ) -> Self {
        let (link, events) = Link::new(
            ClientType::Tcp,
            format!("{}:{}", endpoint.host, endpoint.port),
            log_data,
        );

        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            connect_timeout,
            retry: RetryHandler::new(retry),
            link,
            events: Mutex::new(Some(events)),
        }
    }

    /// Create a new TCP client from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.tcp,
            config.relay.connection_timeout,
            RetryPolicy::from_config(&config.retry),
            config.relay.log_data_transfers,
        )
    }
}

#[async_trait]
impl ConnectionClient for TcpClient {
    fn client_type(&self) -> ClientType {
        ClientType::Tcp
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn state(&self) -> ConnectionState {
        self.link.state()
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        let connected = establish(&self.link, &self.retry, || {
            open_split(ClientType::Tcp, &self.host, self.port, self.connect_timeout)
        })
        .await?;

        if connected {
            info!("TCP connection established to {}", self.endpoint());
        }
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.link.write(data, true).await
    }

    async fn close(&self) {
        self.link.close(TCP_CLOSE_TIMEOUT).await;
    }

    fn stats(&self) -> ConnectionStats {
        self.link.stats()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.lock().take()
    }
}

/// Resolve and connect, returning the split halves
pub(crate) async fn open_split(
    client: ClientType,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(OwnedReadHalf, OwnedWriteHalf), ConnectionError> {
    let stream = open_stream(client, host, port, connect_timeout).await?;
    Ok(stream.into_split())
}

/// Resolve `host:port` and connect to the first address that answers.
///
/// Every attempt is bounded by `connect_timeout`; a timeout or a failed
/// resolution is classified as retryable.
pub(crate) async fn open_stream(
    client: ClientType,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, ConnectionError> {
    let target = format!("{host}:{port}");
    debug!(client = %client, "Resolving {}", target);

    let addrs: Vec<SocketAddr> = match timeout(connect_timeout, lookup_host(target.as_str())).await {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(e)) => {
            return Err(ConnectionError::Io {
                client,
                operation: "resolve",
                class: ErrorClass::Retryable,
                source: e,
            })
        }
        Err(_) => {
            return Err(timed_out(client, "resolve", &target, connect_timeout));
        }
    };

    if addrs.is_empty() {
        return Err(ConnectionError::Io {
            client,
            operation: "resolve",
            class: ErrorClass::Retryable,
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!("{target} resolved to no addresses"),
            ),
        });
    }

    let mut last_error = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(client = %client, "Failed to set TCP_NODELAY on {}: {}", addr, e);
                }
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(client = %client, "Connect to {} failed: {}", addr, e);
                last_error = Some(ConnectionError::io(client, "connect", e));
            }
            Err(_) => {
                debug!(client = %client, "Connect to {} timed out", addr);
                last_error = Some(timed_out(client, "connect", &target, connect_timeout));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| timed_out(client, "connect", &target, connect_timeout)))
}

fn timed_out(client: ClientType, operation: &'static str, target: &str, after: Duration) -> ConnectionError {
    ConnectionError::Io {
        client,
        operation,
        class: ErrorClass::Retryable,
        source: io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{target} did not answer within {after:?}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn endpoint(port: u16) -> TcpEndpointConfig {
        TcpEndpointConfig {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpClient::new(&endpoint(port), Duration::from_secs(2), fast_retry(3), false);
        let mut events = client.take_events().unwrap();
        assert!(client.take_events().is_none());

        client.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        // Second connect is a no-op
        client.connect().await.unwrap();
        assert_eq!(client.stats().attempts, 1);

        client.send(b"\x01I20100\r\n").await.unwrap();
        let mut request = [0u8; 9];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"\x01I20100\r\n");

        server.write_all(b"reply").await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Data(bytes) => {
                    assert_eq!(&bytes[..], b"reply");
                    break;
                }
                _ => continue,
            }
        }

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.stats().bytes_sent, 9);
    }

    #[tokio::test]
    async fn test_refused_connect_is_retried_until_exhausted() {
        let port = closed_port().await;
        let client = TcpClient::new(&endpoint(port), Duration::from_secs(1), fast_retry(3), false);

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.class(), ErrorClass::Retryable);
        assert_eq!(client.stats().attempts, 3);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = TcpClient::new(&endpoint(1), Duration::from_secs(1), fast_retry(1), false);
        let err = client.send(b"x").await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected { client: ClientType::Tcp }));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let client = TcpClient::new(&endpoint(1), Duration::from_secs(1), fast_retry(1), false);
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
