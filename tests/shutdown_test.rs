//! Tests for the shutdown orchestrator

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use relaybridge::config::{Config, ConnectionType};
use relaybridge::relay::{RelayEvent, RelayService};
use relaybridge::report::{LogBuffer, LogEntry, LogSink, ReportError, StatusRecord, StatusSink};
use relaybridge::shutdown::{ExitHandler, ShutdownSettings, EXIT_FAILURE, EXIT_SUCCESS};
use relaybridge::{RetryPolicy, ShutdownOrchestrator};

fn quick_settings() -> ShutdownSettings {
    ShutdownSettings {
        hook_timeout: Duration::from_millis(200),
        resource_timeout: Duration::from_secs(2),
        report_retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
            jitter: false,
        },
    }
}

fn recording_exit() -> (ExitHandler, Arc<Mutex<Vec<i32>>>) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let recorded = codes.clone();
    (Arc::new(move |code| recorded.lock().push(code)), codes)
}

#[derive(Default)]
struct FailingStatusSink {
    calls: AtomicU32,
}

#[async_trait]
impl StatusSink for FailingStatusSink {
    async fn post_status(&self, _record: &StatusRecord) -> Result<(), ReportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ReportError::Rejected("status endpoint unavailable".to_string()))
    }
}

#[derive(Default)]
struct RecordingStatusSink {
    records: Mutex<Vec<StatusRecord>>,
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn post_status(&self, record: &StatusRecord) -> Result<(), ReportError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingLogSink {
    uploads: Mutex<Vec<Vec<LogEntry>>>,
}

#[async_trait]
impl LogSink for RecordingLogSink {
    async fn post_logs(&self, entries: &[LogEntry]) -> Result<(), ReportError> {
        self.uploads.lock().push(entries.to_vec());
        Ok(())
    }
}

fn log_entry(message: &str) -> LogEntry {
    LogEntry {
        timestamp: "2026-01-01T00:00:00.000Z".to_string(),
        level: "INFO".to_string(),
        target: "relaybridge".to_string(),
        message: message.to_string(),
        fields: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_concurrent_shutdown_runs_once() {
    let (exit, codes) = recording_exit();
    let orchestrator = ShutdownOrchestrator::new(quick_settings()).with_exit_handler(exit);

    let hook_runs = Arc::new(AtomicU32::new(0));
    let counter = hook_runs.clone();
    orchestrator.register_hook("count", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    });

    let (first, second) = tokio::join!(
        orchestrator.shutdown(true, "relay completed", EXIT_SUCCESS),
        orchestrator.shutdown(false, "received SIGTERM", EXIT_FAILURE)
    );

    assert_eq!(first.exit_code, second.exit_code);
    assert_eq!(first.reason, second.reason);
    assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
    assert_eq!(codes.lock().len(), 1);
    assert_eq!(orchestrator.result().unwrap().exit_code, first.exit_code);
}

#[tokio::test]
async fn test_status_failure_does_not_block_log_upload_or_exit() {
    let (exit, codes) = recording_exit();
    let status_sink = Arc::new(FailingStatusSink::default());
    let log_sink = Arc::new(RecordingLogSink::default());
    let buffer = LogBuffer::new(16);
    buffer.push(log_entry("relay started"));
    buffer.push(log_entry("relay timeout"));

    let orchestrator = ShutdownOrchestrator::new(quick_settings())
        .with_status_sink(status_sink.clone())
        .with_log_sink(log_sink.clone(), buffer.clone())
        .with_exit_handler(exit);

    let result = orchestrator.shutdown(false, "relay timeout", EXIT_SUCCESS).await;

    assert_eq!(result.exit_code, EXIT_SUCCESS);
    assert_eq!(status_sink.calls.load(Ordering::SeqCst), 3);

    let uploads = log_sink.uploads.lock();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].len(), 2);
    assert_eq!(uploads[0][1].message, "relay timeout");
    assert!(buffer.is_empty());

    assert_eq!(*codes.lock(), vec![EXIT_SUCCESS]);
}

#[tokio::test]
async fn test_shutdown_stops_attached_relay_and_reports_metrics() {
    let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let device_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let mut config = Config::default();
    config.connection_type = ConnectionType::Tcp;
    config.tcp.port = gateway_listener.local_addr().unwrap().port();
    config.secondary_tcp.port = device_listener.local_addr().unwrap().port();
    config.relay.relay_timeout = Duration::from_secs(5);

    let relay = RelayService::from_config(&config).unwrap();
    let mut events = relay.subscribe();
    relay.start().await.unwrap();
    let (mut gateway, _) = gateway_listener.accept().await.unwrap();
    let (mut device, _) = device_listener.accept().await.unwrap();

    gateway.write_all(b"I20100").await.unwrap();
    let mut request = [0u8; 6];
    device.read_exact(&mut request).await.unwrap();

    let (exit, _codes) = recording_exit();
    let status_sink = Arc::new(RecordingStatusSink::default());
    let orchestrator = ShutdownOrchestrator::new(quick_settings())
        .with_status_sink(status_sink.clone())
        .with_exit_handler(exit);
    orchestrator.attach_relay(relay.clone());

    let result = orchestrator.shutdown(true, "received SIGINT", EXIT_SUCCESS).await;
    assert!(!relay.is_running());

    let mut stopped_reason = None;
    while let Ok(event) = events.try_recv() {
        if let RelayEvent::Stopped { reason, .. } = event {
            stopped_reason = Some(reason);
        }
    }
    assert_eq!(stopped_reason.as_deref(), Some("received SIGINT"));

    assert_eq!(result.status.metrics.bytes_transferred_primary_to_secondary, 6);
    assert_eq!(result.status.metrics.total_connections, 2);
    assert_eq!(result.status.connections.len(), 2);

    let records = status_sink.records.lock();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].message, "received SIGINT");
}
