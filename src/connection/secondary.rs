//! Secondary TCP Client
//!
//! The far side of a TCP-to-TCP bridge. Unlike the primary client it watches
//! its socket with a heartbeat and recovers from a dropped peer on the next
//! send with a single reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::link::{establish, Link};
use super::tcp::{open_split, TCP_CLOSE_TIMEOUT};
use super::{ClientEvent, ClientType, ConnectionClient, ConnectionState, ConnectionStats};
use crate::config::{Config, TcpEndpointConfig};
use crate::error::{ConnectionError, ErrorClass};
use crate::retry::{RetryHandler, RetryPolicy};

/// Client for the secondary TCP endpoint
pub struct SecondaryTcpClient {
    host: String,
    port: u16,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    retry: RetryHandler,
    link: Arc<Link<OwnedWriteHalf>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    /// Set while the client has connected and has not been closed since
    reconnect_allowed: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl SecondaryTcpClient {
    pub fn new(
        endpoint: &TcpEndpointConfig,
        connect_timeout: Duration,
        heartbeat_interval: Duration,
        retry: RetryPolicy,
        log_data: bool,
    ) -> Self {
        let (link, events) = Link::new(
            ClientType::SecondaryTcp,
            format!("{}:{}", endpoint.host, endpoint.port),
            log_data,
        );

        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            connect_timeout,
            heartbeat_interval,
            retry: RetryHandler::new(retry),
            link,
            heartbeat: Mutex::new(None),
            reconnect_allowed: AtomicBool::new(false),
            events: Mutex::new(Some(events)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.secondary_tcp,
            config.relay.connection_timeout,
            config.relay.heartbeat_interval,
            RetryPolicy::from_config(&config.retry),
            config.relay.log_data_transfers,
        )
    }

    fn start_heartbeat(&self) {
        let link = Arc::clone(&self.link);
        let epoch = link.epoch();
        let period = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !link.is_current(epoch) || link.state() != ConnectionState::Connected {
                    break;
                }

                if let Some(reason) = probe(&link) {
                    warn!(client = %ClientType::SecondaryTcp, "Heartbeat found dead connection: {}", reason);
                    link.connection_lost(epoch, &reason, Some(ErrorClass::Retryable), true, true)
                        .await;
                    break;
                }
                debug!(client = %ClientType::SecondaryTcp, "Heartbeat ok");
            }
        });

        if let Some(stale) = self.heartbeat.lock().replace(handle) {
            stale.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }

    async fn reconnect_and_send(&self, data: &[u8], cause: ConnectionError) -> Result<usize, ConnectionError> {
        info!(
            client = %ClientType::SecondaryTcp,
            "Send failed ({}), reconnecting to {}",
            cause,
            self.endpoint()
        );
        self.link.record_reconnect();

        if let Err(err) = self.connect().await {
            self.link
                .announce_lost(&format!("reconnect failed: {err}"), Some(err.class()));
            return Err(err);
        }

        self.link.write(data, true).await
    }
}

/// Liveness check against the open socket; `Some(reason)` when it is dead.
/// A write in progress holds the socket, which counts as alive.
fn probe(link: &Link<OwnedWriteHalf>) -> Option<String> {
    if !link.reader_alive() {
        return Some("reader task stopped".to_string());
    }

    let verdict = link.inspect(|writer| {
        match writer.as_ref().take_error() {
            Ok(Some(e)) | Err(e) => return Some(format!("socket error: {e}")),
            Ok(None) => {}
        }
        match writer.peer_addr() {
            Ok(_) => None,
            Err(e) => Some(format!("peer unreachable: {e}")),
        }
    });

    verdict.flatten()
}

#[async_trait]
impl ConnectionClient for SecondaryTcpClient {
    fn client_type(&self) -> ClientType {
        ClientType::SecondaryTcp
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn state(&self) -> ConnectionState {
        self.link.state()
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        let connected = establish(&self.link, &self.retry, || {
            open_split(ClientType::SecondaryTcp, &self.host, self.port, self.connect_timeout)
        })
        .await?;

        if connected {
            self.reconnect_allowed.store(true, Ordering::SeqCst);
            self.start_heartbeat();
            info!("Secondary TCP connection established to {}", self.endpoint());
        }
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        // Hold back the disconnect events until the reconnect has had its chance
        match self.link.write(data, false).await {
            Ok(n) => Ok(n),
            Err(err) if self.reconnect_allowed.load(Ordering::SeqCst) => {
                let lost_now = matches!(err, ConnectionError::Io { .. });
                let dropped_earlier = matches!(err, ConnectionError::NotConnected { .. })
                    && self.link.state() == ConnectionState::Disconnected;

                if lost_now || dropped_earlier {
                    self.reconnect_and_send(data, err).await
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn close(&self) {
        self.reconnect_allowed.store(false, Ordering::SeqCst);
        self.stop_heartbeat();
        self.link.close(TCP_CLOSE_TIMEOUT).await;
    }

    fn stats(&self) -> ConnectionStats {
        self.link.stats()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.lock().take()
    }
}

impl Drop for SecondaryTcpClient {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
