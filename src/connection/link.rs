//! Transport core shared by every client: state machine, counters, the
//! reader task, the write half and the event channel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{ClientEvent, ClientType, ConnectionState, ConnectionStats, DataPreview};
use crate::error::{classify_io, ConnectionError, ErrorClass};
use crate::retry::RetryHandler;

const READ_BUFFER_SIZE: usize = 4096;

/// How long a forced close waits for an aborted write to hand back the write half
const FORCE_RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) struct Link<W> {
    kind: ClientType,
    state: Mutex<ConnectionState>,
    stats: Mutex<ConnectionStats>,
    writer: tokio::sync::Mutex<Option<W>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every transition away from an attempt or an open transport,
    /// so stale readers, heartbeats and connect results can tell they lost.
    epoch: AtomicU64,
    /// Bumped by a forced close; in-flight writes give up the write half
    abort_writes: watch::Sender<u64>,
    events: mpsc::UnboundedSender<ClientEvent>,
    log_data: bool,
}

impl<W> Link<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        kind: ClientType,
        endpoint: String,
        log_data: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (abort_writes, _) = watch::channel(0);
        let link = Arc::new(Self {
            kind,
            state: Mutex::new(ConnectionState::Disconnected),
            stats: Mutex::new(ConnectionStats::new(kind, endpoint)),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            epoch: AtomicU64::new(0),
            abort_writes,
            events,
            log_data,
        });
        (link, receiver)
    }

    pub fn kind(&self) -> ClientType {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.state();
        let mut stats = self.stats.lock().clone();
        stats.state = state;
        stats.connected = state == ConnectionState::Connected;
        stats.connecting = state == ConnectionState::Connecting;
        stats
    }

    /// Disconnected -> Connecting. Returns the attempt's epoch, or `None`
    /// when the client is busy in any other state.
    pub fn begin_connect(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected {
            return None;
        }
        *state = ConnectionState::Connecting;
        Some(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn record_attempt(&self) {
        self.stats.lock().attempts += 1;
    }

    pub fn record_reconnect(&self) {
        self.stats.lock().reconnects += 1;
    }

    fn record_error(&self, message: &str) {
        self.stats.lock().last_error = Some(message.to_string());
    }

    pub fn connect_failed(&self, epoch: u64, err: &ConnectionError) {
        self.record_error(&err.to_string());
        let mut state = self.state.lock();
        if self.is_current(epoch) && *state == ConnectionState::Connecting {
            *state = ConnectionState::Disconnected;
        }
    }

    /// Install a freshly opened transport and start its reader task.
    ///
    /// Fails with `Cancelled` when `close()` ran while the attempt was in
    /// flight; the transport is dropped in that case.
    pub async fn attach<R>(self: &Arc<Self>, epoch: u64, reader: R, writer: W) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut slot = self.writer.lock().await;
        {
            let mut state = self.state.lock();
            if !self.is_current(epoch) || *state != ConnectionState::Connecting {
                debug!(client = %self.kind, "Discarding transport opened after close");
                return Err(ConnectionError::Cancelled { client: self.kind });
            }
            *state = ConnectionState::Connected;
        }
        *slot = Some(writer);
        drop(slot);

        {
            let mut stats = self.stats.lock();
            stats.last_error = None;
            stats.connected_at =
                Some(humantime::format_rfc3339_seconds(SystemTime::now()).to_string());
        }

        let handle = self.spawn_reader(epoch, reader);
        if let Some(stale) = self.reader.lock().replace(handle) {
            stale.abort();
        }

        self.emit(ClientEvent::Connected);
        Ok(())
    }

    fn spawn_reader<R>(self: &Arc<Self>, epoch: u64, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
            loop {
                buffer.reserve(READ_BUFFER_SIZE);
                match reader.read_buf(&mut buffer).await {
                    Ok(0) => {
                        link.connection_lost(epoch, "remote end closed the connection", None, false, true)
                            .await;
                        break;
                    }
                    Ok(n) => {
                        link.stats.lock().bytes_received += n as u64;
                        let chunk = buffer.split().freeze();
                        if link.log_data {
                            let preview = DataPreview::new(&chunk);
                            debug!(client = %link.kind, bytes = n, hex = %preview.hex, ascii = %preview.ascii, "Received data");
                        }
                        link.emit(ClientEvent::Data(chunk));
                    }
                    Err(e) => {
                        let class = classify_io(&e);
                        let reason = format!("read failed: {e}");
                        link.connection_lost(epoch, &reason, Some(class), false, true)
                            .await;
                        break;
                    }
                }
            }
            debug!(client = %link.kind, "Reader task finished");
        })
    }

    /// Tear down an open transport after it failed underneath us.
    ///
    /// Returns false when `epoch` no longer owns the connection. With
    /// `announce` unset the state is cleaned up without emitting events.
    pub async fn connection_lost(
        &self,
        epoch: u64,
        reason: &str,
        error: Option<ErrorClass>,
        abort_reader: bool,
        announce: bool,
    ) -> bool {
        {
            let mut state = self.state.lock();
            if !self.is_current(epoch) || *state != ConnectionState::Connected {
                return false;
            }
            *state = ConnectionState::Disconnected;
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }

        self.writer.lock().await.take();
        let reader = self.reader.lock().take();
        if abort_reader {
            if let Some(handle) = reader {
                handle.abort();
            }
        }

        self.record_error(reason);
        if announce {
            self.announce_lost(reason, error);
        }
        true
    }

    /// Emit error/disconnect events for a connection that is already gone
    pub fn announce_lost(&self, reason: &str, error: Option<ErrorClass>) {
        match error {
            Some(ErrorClass::Unexpected) => {
                error!(client = %self.kind, "Unexpected transport error: {}", reason)
            }
            Some(class) => warn!(client = %self.kind, %class, "Transport error: {}", reason),
            None => info!(client = %self.kind, "Connection closed: {}", reason),
        }

        if let Some(class) = error {
            self.emit(ClientEvent::Error {
                class,
                message: reason.to_string(),
            });
        }
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Write the whole buffer.
    ///
    /// A failed write always tears the transport down; `announce` decides
    /// whether that loss is reported as events.
    pub async fn write(&self, data: &[u8], announce: bool) -> Result<usize, ConnectionError> {
        // Subscribed before queueing on the lock so no forced close is missed
        let mut aborted = self.abort_writes.subscribe();
        let mut slot = self.writer.lock().await;
        let epoch = self.epoch();
        let writer = match slot.as_mut() {
            Some(writer) if self.state() == ConnectionState::Connected => writer,
            _ => return Err(ConnectionError::NotConnected { client: self.kind }),
        };

        let outcome = tokio::select! {
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => Some(result),
            _ = aborted.changed() => None,
        };
        drop(slot);

        let Some(result) = outcome else {
            debug!(client = %self.kind, bytes = data.len(), "Write abandoned by forced close");
            return Err(ConnectionError::WriteAborted { client: self.kind });
        };

        match result {
            Ok(()) => {
                self.stats.lock().bytes_sent += data.len() as u64;
                let preview = DataPreview::new(data);
                if self.log_data {
                    debug!(client = %self.kind, bytes = data.len(), hex = %preview.hex, ascii = %preview.ascii, "Sent data");
                }
                self.emit(ClientEvent::Sent {
                    bytes: data.len(),
                    preview,
                });
                Ok(data.len())
            }
            Err(source) => {
                let err = ConnectionError::io(self.kind, "write", source);
                self.connection_lost(epoch, &err.to_string(), Some(err.class()), true, announce)
                    .await;
                Err(err)
            }
        }
    }

    /// Run `probe` against the write half without waiting on an in-flight write
    pub fn inspect<T>(&self, probe: impl FnOnce(&W) -> T) -> Option<T> {
        let slot = self.writer.try_lock().ok()?;
        slot.as_ref().map(probe)
    }

    /// True while the reader task for the current connection is running
    pub fn reader_alive(&self) -> bool {
        self.reader
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Kill the reader task without tearing the connection down
    #[cfg(test)]
    pub fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().as_ref() {
            handle.abort();
        }
    }

    /// Graceful shutdown of the write half, forced after `grace`
    pub async fn close(&self, grace: Duration) {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Disconnected | ConnectionState::Closing => return,
                ConnectionState::Connecting => {
                    // The in-flight attempt notices the epoch change and discards its result
                    *state = ConnectionState::Disconnected;
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    debug!(client = %self.kind, "Close requested while connecting");
                    return;
                }
                ConnectionState::Connected => {
                    *state = ConnectionState::Closing;
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let graceful = async {
            let writer = self.writer.lock().await.take();
            match writer {
                Some(mut writer) => writer.shutdown().await,
                None => Ok(()),
            }
        };

        match timeout(grace, graceful).await {
            Ok(Ok(())) => debug!(client = %self.kind, "Transport closed gracefully"),
            Ok(Err(e)) => warn!(client = %self.kind, "Error during graceful close: {}", e),
            Err(_) => {
                warn!(client = %self.kind, "Graceful close timed out after {:?}, forcing close", grace);
                self.abort_writes.send_modify(|generation| *generation += 1);
                match timeout(FORCE_RELEASE_TIMEOUT, self.writer.lock()).await {
                    Ok(mut slot) => drop(slot.take()),
                    Err(_) => error!(client = %self.kind, "Write half still held after forced close"),
                }
            }
        }

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }

        *self.state.lock() = ConnectionState::Disconnected;
        info!(client = %self.kind, "Connection closed");
    }

    fn emit(&self, event: ClientEvent) {
        // The receiver disappears once the relay is torn down
        let _ = self.events.send(event);
    }
}

/// Connect `link` through `retry`, opening the transport with `open`.
///
/// Returns `Ok(false)` when the client was already connected or connecting.
pub(crate) async fn establish<W, R, F, Fut>(
    link: &Arc<Link<W>>,
    retry: &RetryHandler,
    mut open: F,
) -> Result<bool, ConnectionError>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(R, W), ConnectionError>>,
{
    let kind = link.kind();
    let Some(epoch) = link.begin_connect() else {
        debug!(client = %kind, state = %link.state(), "Connect ignored, client already active");
        return Ok(false);
    };

    let operation = format!("{kind} connect");
    let opened = retry
        .execute_if(
            &operation,
            |_attempt| {
                let pending = if link.is_current(epoch) {
                    link.record_attempt();
                    Some(open())
                } else {
                    None
                };
                async move {
                    match pending {
                        Some(fut) => fut.await,
                        None => Err(ConnectionError::Cancelled { client: kind }),
                    }
                }
            },
            |err: &ConnectionError| err.class() != ErrorClass::Fatal,
        )
        .await;

    match opened {
        Ok((reader, writer)) => {
            link.attach(epoch, reader, writer).await?;
            Ok(true)
        }
        Err(err) => {
            let err = ConnectionError::from_retry(kind, err);
            link.connect_failed(epoch, &err);
            error!(client = %kind, "Connection failed: {}", err);
            Err(err)
        }
    }
}
