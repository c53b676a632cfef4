//! Relay Service
//!
//! Connects the primary and secondary clients, forwards bytes between them
//! and decides the session outcome. Every relay decision is made on one task,
//! so the deadline and the first-transfer flag never race. Writes run on one
//! forwarder task per direction, so a stalled peer never holds up the
//! deadline or the opposite direction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::events::{Direction, RelayEvent};
use super::session::{RelaySession, RelayStats};
use crate::config::Config;
use crate::connection::{build_clients, ClientEvent, ClientType, ConnectionClient};
use crate::error::{ConfigError, ConnectionError};
use crate::shutdown::ManagedResource;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("relay service already started")]
    AlreadyStarted,

    #[error("relay service was stopped before it started")]
    Stopped,

    #[error("event stream of the {client} client was already taken")]
    EventsUnavailable { client: ClientType },

    #[error(transparent)]
    Connect(#[from] ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Primary,
    Secondary,
}

impl Side {
    fn outbound(self) -> Direction {
        match self {
            Side::Primary => Direction::PrimaryToSecondary,
            Side::Secondary => Direction::SecondaryToPrimary,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::Primary => "primary",
            Side::Secondary => "secondary",
        }
    }
}

enum Flow {
    Continue,
    Finished,
}

/// Result of one write, reported back to the relay loop
struct Forwarded {
    direction: Direction,
    result: Result<usize, ConnectionError>,
}

/// Per-direction write queues; the forwarder tasks die with this value
struct Forwarders {
    to_primary: mpsc::UnboundedSender<Bytes>,
    to_secondary: mpsc::UnboundedSender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

impl Forwarders {
    fn spawn(
        primary: &Arc<dyn ConnectionClient>,
        secondary: &Arc<dyn ConnectionClient>,
    ) -> (Self, mpsc::UnboundedReceiver<Forwarded>) {
        let (results, results_rx) = mpsc::unbounded_channel();
        let (to_secondary, secondary_queue) = mpsc::unbounded_channel();
        let (to_primary, primary_queue) = mpsc::unbounded_channel();

        let tasks = vec![
            spawn_forwarder(
                Arc::clone(secondary),
                Direction::PrimaryToSecondary,
                secondary_queue,
                results.clone(),
            ),
            spawn_forwarder(
                Arc::clone(primary),
                Direction::SecondaryToPrimary,
                primary_queue,
                results,
            ),
        ];

        let forwarders = Self {
            to_primary,
            to_secondary,
            tasks,
        };
        (forwarders, results_rx)
    }

    fn enqueue(&self, direction: Direction, data: Bytes) {
        let queue = match direction {
            Direction::PrimaryToSecondary => &self.to_secondary,
            Direction::SecondaryToPrimary => &self.to_primary,
        };
        if queue.send(data).is_err() {
            warn!(%direction, "Forwarder is gone, dropping data");
        }
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Writes queued chunks to `target` in arrival order
fn spawn_forwarder(
    target: Arc<dyn ConnectionClient>,
    direction: Direction,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    results: mpsc::UnboundedSender<Forwarded>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = queue.recv().await {
            let result = target.send(&data).await;
            if results.send(Forwarded { direction, result }).is_err() {
                break;
            }
        }
        debug!(%direction, "Forwarder finished");
    })
}

/// Bridges two connection clients for a single session
pub struct RelayService {
    primary: Arc<dyn ConnectionClient>,
    secondary: Arc<dyn ConnectionClient>,
    relay_timeout: Duration,
    events: broadcast::Sender<RelayEvent>,
    session: Mutex<Option<Arc<RelaySession>>>,
    started: AtomicBool,
    running: AtomicBool,
    stopping: AtomicBool,
    cancel: watch::Sender<bool>,
    relay_task: Mutex<Option<JoinHandle<()>>>,
    final_stats: OnceCell<RelayStats>,
}

impl RelayService {
    pub fn new(
        primary: Arc<dyn ConnectionClient>,
        secondary: Arc<dyn ConnectionClient>,
        relay_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel, _) = watch::channel(false);

        Arc::new(Self {
            primary,
            secondary,
            relay_timeout,
            events,
            session: Mutex::new(None),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            cancel,
            relay_task: Mutex::new(None),
            final_stats: OnceCell::new(),
        })
    }

    /// Build both clients from configuration
    pub fn from_config(config: &Config) -> Result<Arc<Self>, ConfigError> {
        let (primary, secondary) = build_clients(config)?;
        Ok(Self::new(primary, secondary, config.relay.relay_timeout))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst)
    }

    pub fn data_relayed(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.data_relayed())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            session: self.session.lock().as_ref().map(|s| s.to_stats()),
            primary: self.primary.stats(),
            secondary: self.secondary.stats(),
        }
    }

    /// Connect primary then secondary and start relaying.
    ///
    /// On a connect failure whatever was opened is closed again and the
    /// error is returned.
    pub async fn start(self: &Arc<Self>) -> Result<(), StartError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(StartError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }

        let primary_rx = self.primary.take_events().ok_or(StartError::EventsUnavailable {
            client: self.primary.client_type(),
        })?;
        let secondary_rx = self
            .secondary
            .take_events()
            .ok_or(StartError::EventsUnavailable {
                client: self.secondary.client_type(),
            })?;

        info!(
            "Starting relay: {} ({}) <-> {} ({})",
            self.primary.endpoint(),
            self.primary.client_type(),
            self.secondary.endpoint(),
            self.secondary.client_type()
        );

        if let Err(e) = self.primary.connect().await {
            error!("Primary connection failed: {}", e);
            self.primary.close().await;
            return Err(e.into());
        }

        if self.stopping.load(Ordering::SeqCst) {
            self.abandon_start().await;
            return Err(StartError::Stopped);
        }

        if let Err(e) = self.secondary.connect().await {
            error!("Secondary connection failed: {}", e);
            tokio::join!(self.primary.close(), self.secondary.close());
            return Err(e.into());
        }

        if self.stopping.load(Ordering::SeqCst) {
            self.abandon_start().await;
            return Err(StartError::Stopped);
        }

        let session = Arc::new(RelaySession::new());
        *self.session.lock() = Some(Arc::clone(&session));
        self.running.store(true, Ordering::SeqCst);

        info!(
            session_id = %session.session_id,
            "Relay started, waiting up to {:?} for data",
            self.relay_timeout
        );
        self.emit(RelayEvent::Started {
            session_id: session.session_id.clone(),
        });

        let service = Arc::clone(self);
        let cancel = self.cancel.subscribe();
        let handle = tokio::spawn(async move {
            service.relay_loop(session, primary_rx, secondary_rx, cancel).await;
        });
        *self.relay_task.lock() = Some(handle);

        Ok(())
    }

    /// stop() ran while we were connecting; close whatever it could not see open
    async fn abandon_start(&self) {
        info!("Relay stopped while connecting, closing clients");
        tokio::join!(self.primary.close(), self.secondary.close());
    }

    async fn relay_loop(
        self: Arc<Self>,
        session: Arc<RelaySession>,
        mut primary_rx: mpsc::UnboundedReceiver<ClientEvent>,
        mut secondary_rx: mpsc::UnboundedReceiver<ClientEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let deadline = sleep(self.relay_timeout);
        tokio::pin!(deadline);

        let cancelled = *cancel.borrow();
        if cancelled {
            return;
        }

        let (forwarders, mut forwarded) = Forwarders::spawn(&self.primary, &self.secondary);

        loop {
            let flow = tokio::select! {
                biased;

                changed = cancel.changed() => {
                    let cancelled = changed.is_err() || *cancel.borrow();
                    if cancelled {
                        Flow::Finished
                    } else {
                        Flow::Continue
                    }
                }
                // Writes that finished before the deadline count toward it
                Some(done) = forwarded.recv() => {
                    self.record_forward(&session, done);
                    Flow::Continue
                }
                _ = &mut deadline => {
                    self.resolve_deadline(&session);
                    Flow::Finished
                }
                Some(event) = primary_rx.recv() => {
                    self.handle_client_event(&session, &forwarders, Side::Primary, event).await
                }
                Some(event) = secondary_rx.recv() => {
                    self.handle_client_event(&session, &forwarders, Side::Secondary, event).await
                }
            };

            if let Flow::Finished = flow {
                break;
            }
        }

        debug!(session_id = %session.session_id, "Relay loop finished");
    }

    fn resolve_deadline(&self, session: &RelaySession) {
        if session.data_relayed() {
            let reason = format!(
                "relay completed: data relayed within {:?}",
                self.relay_timeout
            );
            info!("{}", reason);
            self.emit(RelayEvent::Completed { reason });
        } else {
            let reason = format!("relay timeout: no data relayed within {:?}", self.relay_timeout);
            warn!("{}", reason);
            self.emit(RelayEvent::Timeout { reason });
        }
    }

    async fn handle_client_event(
        &self,
        session: &RelaySession,
        forwarders: &Forwarders,
        side: Side,
        event: ClientEvent,
    ) -> Flow {
        match event {
            ClientEvent::Data(data) => {
                forwarders.enqueue(side.outbound(), data);
                Flow::Continue
            }
            ClientEvent::Error { class, message } => {
                session.record_error();
                warn!(side = side.name(), %class, "Client error: {}", message);
                Flow::Continue
            }
            ClientEvent::Disconnected { reason } => {
                if self.stopping.load(Ordering::SeqCst) {
                    return Flow::Finished;
                }
                self.handle_disconnect(session, side, &reason).await;
                Flow::Finished
            }
            ClientEvent::Connected | ClientEvent::Sent { .. } => Flow::Continue,
        }
    }

    fn record_forward(&self, session: &RelaySession, forwarded: Forwarded) {
        let Forwarded { direction, result } = forwarded;

        match result {
            Ok(bytes) => {
                if session.record_transfer(direction, bytes) {
                    info!(%direction, bytes, "First data relayed");
                    self.emit(RelayEvent::FirstDataRelayed { direction });
                }
                debug!(%direction, bytes, "Data relayed");
                self.emit(RelayEvent::DataRelayed { direction, bytes });
            }
            Err(e) => {
                session.record_error();
                warn!(%direction, "Relay error: {}", e);
                self.emit(RelayEvent::RelayError {
                    direction,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn handle_disconnect(&self, session: &RelaySession, side: Side, reason: &str) {
        let client = match side {
            Side::Primary => &self.primary,
            Side::Secondary => &self.secondary,
        };
        let when = if session.data_relayed() {
            "after"
        } else {
            "before"
        };
        let info = format!(
            "{} {} client disconnected {} first successful transfer: {}",
            side.name(),
            client.client_type(),
            when,
            reason
        );

        warn!("{}", info);
        self.emit(RelayEvent::ClientDisconnected {
            client_type: client.client_type(),
            info: info.clone(),
        });
        self.stop(&info).await;
    }

    /// Stop relaying and close both clients.
    ///
    /// Only the first call does the work and emits `Stopped`; every caller
    /// gets the same final statistics.
    pub async fn stop(&self, reason: &str) -> RelayStats {
        self.final_stats
            .get_or_init(|| self.shutdown_clients(reason))
            .await
            .clone()
    }

    async fn shutdown_clients(&self, reason: &str) -> RelayStats {
        self.stopping.store(true, Ordering::SeqCst);
        info!("Stopping relay: {}", reason);

        let _ = self.cancel.send(true);
        tokio::join!(self.primary.close(), self.secondary.close());
        self.running.store(false, Ordering::SeqCst);

        let session = self.session.lock().clone();
        if let Some(session) = &session {
            session.log_stats();
        }

        let stats = self.stats();
        let success = stats.data_relayed();
        self.emit(RelayEvent::Stopped {
            success,
            reason: reason.to_string(),
            stats: stats.clone(),
        });
        info!(success, "Relay stopped");
        stats
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ManagedResource for RelayService {
    fn name(&self) -> &str {
        "relay service"
    }

    async fn close(&self, reason: &str) -> crate::Result<()> {
        self.stop(reason).await;
        Ok(())
    }
}

impl Drop for RelayService {
    fn drop(&mut self) {
        if let Some(handle) = self.relay_task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpEndpointConfig;
    use crate::connection::{ConnectionState, ConnectionStats, SecondaryTcpClient, TcpClient};
    use crate::retry::RetryPolicy;
    use std::sync::atomic::AtomicU32;
    use tokio::net::TcpListener;

    /// In-memory client that counts connects and closes
    struct CountingClient {
        kind: ClientType,
        connect_delay: Duration,
        connects: AtomicU32,
        closes: AtomicU32,
        state: Mutex<ConnectionState>,
        events: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
        _sender: mpsc::UnboundedSender<ClientEvent>,
    }

    impl CountingClient {
        fn new(kind: ClientType, connect_delay: Duration) -> Arc<Self> {
            let (sender, events) = mpsc::unbounded_channel();
            Arc::new(Self {
                kind,
                connect_delay,
                connects: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                state: Mutex::new(ConnectionState::Disconnected),
                events: Mutex::new(Some(events)),
                _sender: sender,
            })
        }
    }

    #[async_trait]
    impl ConnectionClient for CountingClient {
        fn client_type(&self) -> ClientType {
            self.kind
        }

        fn endpoint(&self) -> String {
            "memory".to_string()
        }

        fn state(&self) -> ConnectionState {
            *self.state.lock()
        }

        async fn connect(&self) -> Result<(), ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.connect_delay).await;
            *self.state.lock() = ConnectionState::Connected;
            Ok(())
        }

        async fn send(&self, data: &[u8]) -> Result<usize, ConnectionError> {
            Ok(data.len())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = ConnectionState::Disconnected;
        }

        fn stats(&self) -> ConnectionStats {
            let mut stats = ConnectionStats::new(self.kind, self.endpoint());
            stats.state = self.state();
            stats
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
            self.events.lock().take()
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            backoff_factor: 1.0,
            jitter: false,
        }
    }

    fn endpoint(port: u16) -> TcpEndpointConfig {
        TcpEndpointConfig {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    fn service_for(primary: u16, secondary: u16, relay_timeout: Duration) -> Arc<RelayService> {
        RelayService::new(
            Arc::new(TcpClient::new(&endpoint(primary), Duration::from_secs(1), quick_retry(), false)),
            Arc::new(SecondaryTcpClient::new(
                &endpoint(secondary),
                Duration::from_secs(1),
                Duration::from_secs(60),
                quick_retry(),
                false,
            )),
            relay_timeout,
        )
    }

    #[tokio::test]
    async fn test_secondary_failure_closes_primary() {
        let primary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let secondary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let secondary_port = secondary.local_addr().unwrap().port();
        drop(secondary);

        let service = service_for(
            primary.local_addr().unwrap().port(),
            secondary_port,
            Duration::from_secs(5),
        );

        let err = service.start().await.unwrap_err();
        assert!(matches!(err, StartError::Connect(_)));
        assert!(!service.is_running());

        let stats = service.stats();
        assert_eq!(stats.primary.state, ConnectionState::Disconnected);
        assert!(stats.session.is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_emits_stopped() {
        let service = service_for(1, 2, Duration::from_secs(5));
        let mut events = service.subscribe();

        let stats = service.stop("not needed").await;
        assert!(!stats.data_relayed());
        match events.recv().await.unwrap() {
            RelayEvent::Stopped { success, reason, .. } => {
                assert!(!success);
                assert_eq!(reason, "not needed");
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(matches!(service.start().await, Err(StartError::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_during_primary_connect_leaves_secondary_closed() {
        let primary = CountingClient::new(ClientType::Tcp, Duration::from_millis(100));
        let secondary = CountingClient::new(ClientType::SecondaryTcp, Duration::ZERO);
        let service = RelayService::new(primary.clone(), secondary.clone(), Duration::from_secs(5));

        let starting = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.start().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.stop("stopped while connecting").await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(StartError::Stopped)));
        assert_eq!(secondary.connects.load(Ordering::SeqCst), 0);
        assert_eq!(primary.state(), ConnectionState::Disconnected);
        assert_eq!(secondary.state(), ConnectionState::Disconnected);
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let primary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let secondary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service = service_for(
            primary.local_addr().unwrap().port(),
            secondary.local_addr().unwrap().port(),
            Duration::from_secs(5),
        );

        service.start().await.unwrap();
        assert!(service.is_running());
        assert!(matches!(service.start().await, Err(StartError::AlreadyStarted)));

        service.stop("test finished").await;
        assert!(!service.is_running());
    }
}
