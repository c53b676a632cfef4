//! Reporting sinks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::log_buffer::LogEntry;
use super::status::StatusRecord;
use crate::config::ReportingConfig;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{0}")]
    Rejected(String),
}

/// Destination of the final status record
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn post_status(&self, record: &StatusRecord) -> Result<(), ReportError>;
}

/// Destination of buffered diagnostic logs
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn post_logs(&self, entries: &[LogEntry]) -> Result<(), ReportError>;
}

#[derive(Serialize)]
struct LogUpload<'a> {
    count: usize,
    entries: &'a [LogEntry],
}

fn http_client(url: &str, request_timeout: Duration) -> Result<reqwest::Client, ReportError> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|source| ReportError::Http {
            url: url.to_string(),
            source,
        })
}

async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
) -> Result<(), ReportError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|source| ReportError::Http {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ReportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    debug!("Posted report to {} ({})", url, status);
    Ok(())
}

pub struct HttpStatusSink {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusSink {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ReportError> {
        let url = url.into();
        Ok(Self {
            client: http_client(&url, request_timeout)?,
            url,
        })
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn post_status(&self, record: &StatusRecord) -> Result<(), ReportError> {
        post_json(&self.client, &self.url, record).await
    }
}

pub struct HttpLogSink {
    client: reqwest::Client,
    url: String,
}

impl HttpLogSink {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ReportError> {
        let url = url.into();
        Ok(Self {
            client: http_client(&url, request_timeout)?,
            url,
        })
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn post_logs(&self, entries: &[LogEntry]) -> Result<(), ReportError> {
        let upload = LogUpload {
            count: entries.len(),
            entries,
        };
        post_json(&self.client, &self.url, &upload).await
    }
}

/// Sinks enabled by the `[reporting]` section
pub fn sinks_from_config(
    config: &ReportingConfig,
) -> Result<(Option<Arc<dyn StatusSink>>, Option<Arc<dyn LogSink>>), ReportError> {
    let status: Option<Arc<dyn StatusSink>> = match (&config.status_url, config.enabled) {
        (Some(url), true) => Some(Arc::new(HttpStatusSink::new(url.clone(), config.request_timeout)?)),
        _ => None,
    };

    let logs: Option<Arc<dyn LogSink>> = match (&config.logs_url, config.upload_logs) {
        (Some(url), true) => Some(Arc::new(HttpLogSink::new(url.clone(), config.request_timeout)?)),
        _ => None,
    };

    Ok((status, logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one HTTP request, answer with `status_line` and return the raw request
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/status", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    #[tokio::test]
    async fn test_status_sink_posts_json() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK").await;
        let sink = HttpStatusSink::new(url, Duration::from_secs(5)).unwrap();
        let record = StatusRecord::new(true, "relay completed", Duration::from_secs(1), None);

        sink.post_status(&record).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /status"));
        assert!(request.contains("\"runTimestamp\""));
        assert!(request.contains("\"relay completed\""));
    }

    #[tokio::test]
    async fn test_status_sink_reports_http_errors() {
        let (url, server) = one_shot_server("HTTP/1.1 503 Service Unavailable").await;
        let sink = HttpStatusSink::new(url, Duration::from_secs(5)).unwrap();
        let record = StatusRecord::new(false, "timeout", Duration::from_secs(1), None);

        let err = sink.post_status(&record).await.unwrap_err();
        assert!(matches!(err, ReportError::Status { status: 503, .. }));
        server.await.unwrap();
    }

    #[test]
    fn test_sinks_follow_reporting_flags() {
        let mut config = ReportingConfig::default();
        let (status, logs) = sinks_from_config(&config).unwrap();
        assert!(status.is_none() && logs.is_none());

        config.enabled = true;
        config.status_url = Some("http://127.0.0.1:9/status".to_string());
        config.upload_logs = true;
        config.logs_url = Some("http://127.0.0.1:9/logs".to_string());
        let (status, logs) = sinks_from_config(&config).unwrap();
        assert!(status.is_some() && logs.is_some());
    }
}
