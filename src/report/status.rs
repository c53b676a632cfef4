//! Final status record

use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::connection::ConnectionStats;
use crate::relay::RelayStats;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMetrics {
    pub bytes_transferred_primary_to_secondary: u64,
    pub bytes_transferred_secondary_to_primary: u64,
    pub bytes_transferred_total: u64,
    pub data_transfers: u64,
    pub errors: u64,
    pub total_connections: u32,
}

/// Outcome of one run as posted to the status sink
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub run_timestamp: String,
    pub success: bool,
    pub message: String,
    pub connections: Vec<ConnectionStats>,
    pub metrics: StatusMetrics,
    /// Run time in milliseconds
    pub duration: u64,
}

impl StatusRecord {
    pub fn new(success: bool, message: impl Into<String>, duration: Duration, relay: Option<&RelayStats>) -> Self {
        let mut record = Self {
            run_timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            success,
            message: message.into(),
            connections: Vec::new(),
            metrics: StatusMetrics::default(),
            duration: duration.as_millis() as u64,
        };
        if let Some(stats) = relay {
            record.apply_relay_stats(stats);
        }
        record
    }

    /// Replace connection and transfer figures with a newer snapshot
    pub fn apply_relay_stats(&mut self, stats: &RelayStats) {
        let mut metrics = StatusMetrics {
            total_connections: stats.total_connections(),
            ..StatusMetrics::default()
        };
        if let Some(session) = &stats.session {
            metrics.bytes_transferred_primary_to_secondary = session.bytes_primary_to_secondary;
            metrics.bytes_transferred_secondary_to_primary = session.bytes_secondary_to_primary;
            metrics.bytes_transferred_total = session.total_bytes;
            metrics.data_transfers = session.data_transfers;
            metrics.errors = session.errors;
        }

        self.connections = vec![stats.primary.clone(), stats.secondary.clone()];
        self.metrics = metrics;
    }
}
