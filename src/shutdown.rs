//! Shutdown Orchestration
//!
//! One authoritative teardown per process: finalize the status record, run
//! hooks, close resources, report, then exit. Every step is bounded and a
//! failing step never blocks the ones after it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::signal;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::relay::RelayService;
use crate::report::{LogBuffer, LogSink, StatusRecord, StatusSink};
use crate::retry::{RetryHandler, RetryPolicy};
use crate::Result;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Something that must be released before the process exits
#[async_trait]
pub trait ManagedResource: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self, reason: &str) -> Result<()>;
}

type HookFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

/// Called with the exit code once the sequence has finished
pub type ExitHandler = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownResult {
    pub success: bool,
    pub reason: String,
    pub exit_code: i32,
    pub status: StatusRecord,
}

/// Timeouts and retry discipline of the shutdown sequence
#[derive(Debug, Clone)]
pub struct ShutdownSettings {
    pub hook_timeout: Duration,
    pub resource_timeout: Duration,
    pub report_retry: RetryPolicy,
}

impl ShutdownSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hook_timeout: config.shutdown.hook_timeout,
            resource_timeout: config.shutdown.resource_timeout,
            report_retry: RetryPolicy {
                max_retries: config.reporting.max_retries,
                base_delay: config.reporting.retry_delay,
                max_delay: config.reporting.retry_delay * 4,
                backoff_factor: 2.0,
                jitter: false,
            },
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ShutdownOrchestrator {
    settings: ShutdownSettings,
    started_at: Instant,
    shutting_down: AtomicBool,
    result: OnceCell<ShutdownResult>,
    hooks: Mutex<Vec<(String, Hook)>>,
    resources: Mutex<Vec<Arc<dyn ManagedResource>>>,
    relay: Mutex<Option<Arc<RelayService>>>,
    status_sink: Option<Arc<dyn StatusSink>>,
    log_sink: Option<(Arc<dyn LogSink>, LogBuffer)>,
    exit_handler: ExitHandler,
}

impl ShutdownOrchestrator {
    pub fn new(settings: ShutdownSettings) -> Self {
        Self {
            settings,
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
            result: OnceCell::new(),
            hooks: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            relay: Mutex::new(None),
            status_sink: None,
            log_sink: None,
            exit_handler: Arc::new(|code| std::process::exit(code)),
        }
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Upload the contents of `buffer` to `sink` at shutdown
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>, buffer: LogBuffer) -> Self {
        self.log_sink = Some((sink, buffer));
        self
    }

    pub fn with_exit_handler(mut self, handler: ExitHandler) -> Self {
        self.exit_handler = handler;
        self
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Result of the completed sequence, if it has run
    pub fn result(&self) -> Option<ShutdownResult> {
        self.result.get().cloned()
    }

    pub fn register_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: Hook = Box::new(move || Box::pin(hook()));
        self.hooks.lock().push((name.into(), hook));
    }

    pub fn register_resource(&self, resource: Arc<dyn ManagedResource>) {
        debug!("Registered shutdown resource: {}", resource.name());
        self.resources.lock().push(resource);
    }

    /// Register the relay as a resource and use its statistics in the status record
    pub fn attach_relay(&self, relay: Arc<RelayService>) {
        self.register_resource(relay.clone());
        *self.relay.lock() = Some(relay);
    }

    /// Run the shutdown sequence.
    ///
    /// Only the first call runs it; every caller gets that call's result.
    pub async fn shutdown(&self, success: bool, reason: &str, exit_code: i32) -> ShutdownResult {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress, ignoring request: {}", reason);
        }

        self.result
            .get_or_init(|| self.run_sequence(success, reason, exit_code))
            .await
            .clone()
    }

    async fn run_sequence(&self, success: bool, reason: &str, exit_code: i32) -> ShutdownResult {
        info!(success, exit_code, "Shutting down: {}", reason);

        let relay = self.relay.lock().clone();
        let mut status = StatusRecord::new(
            success,
            reason,
            self.started_at.elapsed(),
            relay.as_ref().map(|r| r.stats()).as_ref(),
        );

        self.run_hooks().await;
        self.close_resources(reason).await;

        if let Some(relay) = &relay {
            status.apply_relay_stats(&relay.stats());
        }

        self.post_status(&status).await;
        self.flush_logs().await;

        let result = ShutdownResult {
            success,
            reason: reason.to_string(),
            exit_code,
            status,
        };

        info!(
            "Shutdown complete in {:?}, exiting with code {}",
            self.started_at.elapsed(),
            exit_code
        );
        (self.exit_handler)(exit_code);
        result
    }

    async fn run_hooks(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (name, hook) in hooks {
            debug!("Running shutdown hook: {}", name);
            let mut handle = tokio::spawn(hook());

            match timeout(self.settings.hook_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => debug!("Shutdown hook {} finished", name),
                Ok(Ok(Err(e))) => warn!("Shutdown hook {} failed: {:#}", name, e),
                Ok(Err(e)) => error!("Shutdown hook {} panicked: {}", name, e),
                Err(_) => {
                    handle.abort();
                    warn!(
                        "Shutdown hook {} timed out after {:?}",
                        name, self.settings.hook_timeout
                    );
                }
            }
        }
    }

    async fn close_resources(&self, reason: &str) {
        let resources = std::mem::take(&mut *self.resources.lock());
        for resource in resources {
            let name = resource.name().to_string();
            debug!("Closing resource: {}", name);

            let reason = reason.to_string();
            let mut handle = tokio::spawn(async move { resource.close(&reason).await });

            match timeout(self.settings.resource_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => debug!("Resource {} closed", name),
                Ok(Ok(Err(e))) => warn!("Failed to close {}: {:#}", name, e),
                Ok(Err(e)) => error!("Closing {} panicked: {}", name, e),
                Err(_) => {
                    handle.abort();
                    warn!(
                        "Closing {} timed out after {:?}",
                        name, self.settings.resource_timeout
                    );
                }
            }
        }
    }

    async fn post_status(&self, status: &StatusRecord) {
        let Some(sink) = &self.status_sink else {
            debug!("No status sink configured");
            return;
        };

        let retry = RetryHandler::new(self.settings.report_retry.clone());
        match retry
            .execute("status report", |_| sink.post_status(status))
            .await
        {
            Ok(()) => info!("Final status reported"),
            Err(e) => warn!("Failed to report final status: {}", e),
        }
    }

    async fn flush_logs(&self) {
        let Some((sink, buffer)) = &self.log_sink else {
            return;
        };

        let entries = buffer.drain();
        if entries.is_empty() {
            return;
        }

        let retry = RetryHandler::new(self.settings.report_retry.clone());
        match retry
            .execute("log upload", |_| sink.post_logs(&entries))
            .await
        {
            Ok(()) => info!("Uploaded {} log entries", entries.len()),
            Err(e) => warn!("Failed to upload logs: {}", e),
        }
    }
}

/// Wait for SIGINT, SIGTERM or Ctrl+C and return the signal's name
pub async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = signal::ctrl_c() => "Ctrl+C",
        };
        info!("Received {}, initiating shutdown", name);
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating shutdown");
        Ok("Ctrl+C")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportError;
    use std::sync::atomic::AtomicU32;

    fn quick_settings() -> ShutdownSettings {
        ShutdownSettings {
            hook_timeout: Duration::from_millis(100),
            resource_timeout: Duration::from_millis(100),
            report_retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
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

    struct SlowResource {
        closed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ManagedResource for SlowResource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn close(&self, _reason: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingResource {
        closed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ManagedResource for CountingResource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn close(&self, _reason: &str) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingStatusSink {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StatusSink for FailingStatusSink {
        async fn post_status(&self, _record: &StatusRecord) -> std::result::Result<(), ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ReportError::Rejected("sink offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failing_steps_do_not_block_later_steps() {
        let (exit, codes) = recording_exit();
        let orchestrator = ShutdownOrchestrator::new(quick_settings())
            .with_status_sink(Arc::new(FailingStatusSink {
                calls: Arc::new(AtomicU32::new(0)),
            }))
            .with_exit_handler(exit);

        orchestrator.register_hook("fails", || async { Err(anyhow::anyhow!("hook broke")) });
        orchestrator.register_hook("hangs", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        orchestrator.register_hook("panics", || async {
            let hooks: Vec<u8> = Vec::new();
            assert!(!hooks.is_empty(), "hook panicked");
            Ok(())
        });

        let slow = Arc::new(AtomicU32::new(0));
        let fast = Arc::new(AtomicU32::new(0));
        orchestrator.register_resource(Arc::new(SlowResource { closed: slow.clone() }));
        orchestrator.register_resource(Arc::new(CountingResource { closed: fast.clone() }));

        let result = orchestrator.shutdown(true, "relay completed", EXIT_SUCCESS).await;

        assert!(result.success);
        assert_eq!(result.exit_code, EXIT_SUCCESS);
        assert_eq!(slow.load(Ordering::SeqCst), 0);
        assert_eq!(fast.load(Ordering::SeqCst), 1);
        assert_eq!(*codes.lock(), vec![EXIT_SUCCESS]);
    }

    #[tokio::test]
    async fn test_second_call_observes_first_result() {
        let (exit, codes) = recording_exit();
        let orchestrator = ShutdownOrchestrator::new(quick_settings()).with_exit_handler(exit);

        let first = orchestrator.shutdown(false, "relay timeout", EXIT_SUCCESS).await;
        let second = orchestrator.shutdown(true, "SIGTERM", EXIT_FAILURE).await;

        assert!(orchestrator.is_shutting_down());
        assert_eq!(first.reason, second.reason);
        assert_eq!(second.exit_code, EXIT_SUCCESS);
        assert!(!second.success);
        assert_eq!(codes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_settings_follow_reporting_config() {
        let mut config = Config::default();
        config.reporting.max_retries = 5;
        config.shutdown.hook_timeout = Duration::from_secs(2);

        let settings = ShutdownSettings::from_config(&config);
        assert_eq!(settings.report_retry.max_retries, 5);
        assert_eq!(settings.hook_timeout, Duration::from_secs(2));
        assert_eq!(settings.report_retry.base_delay, config.reporting.retry_delay);
    }
}
