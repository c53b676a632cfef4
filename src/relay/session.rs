//! Relay Session

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, info};

use super::events::Direction;
use crate::connection::ConnectionStats;

/// Counters for one relay session
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub start_time: Instant,
    started_at: SystemTime,
    data_relayed: AtomicBool,
    bytes_primary_to_secondary: AtomicU64,
    bytes_secondary_to_primary: AtomicU64,
    transfers_primary_to_secondary: AtomicU64,
    transfers_secondary_to_primary: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of a session's counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,
    pub start_time: String,
    pub duration_ms: u64,
    pub data_relayed: bool,
    pub bytes_primary_to_secondary: u64,
    pub bytes_secondary_to_primary: u64,
    pub total_bytes: u64,
    pub transfers_primary_to_secondary: u64,
    pub transfers_secondary_to_primary: u64,
    pub data_transfers: u64,
    pub errors: u64,
}

/// Final statistics of a relay service: the session (if one started) and
/// both clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub session: Option<SessionStats>,
    pub primary: ConnectionStats,
    pub secondary: ConnectionStats,
}

impl RelayStats {
    pub fn data_relayed(&self) -> bool {
        self.session.as_ref().map(|s| s.data_relayed).unwrap_or(false)
    }

    /// Connections that were open at some point
    pub fn total_connections(&self) -> u32 {
        [&self.primary, &self.secondary]
            .iter()
            .filter(|c| c.connected_at.is_some())
            .count() as u32
    }
}

impl RelaySession {
    pub fn new() -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!("Creating new relay session: {}", session_id);

        Self {
            session_id,
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            data_relayed: AtomicBool::new(false),
            bytes_primary_to_secondary: AtomicU64::new(0),
            bytes_secondary_to_primary: AtomicU64::new(0),
            transfers_primary_to_secondary: AtomicU64::new(0),
            transfers_secondary_to_primary: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn data_relayed(&self) -> bool {
        self.data_relayed.load(Ordering::SeqCst)
    }

    /// Count a successful forward. Returns true only for the forward that
    /// flipped `data_relayed`.
    pub fn record_transfer(&self, direction: Direction, bytes: usize) -> bool {
        let bytes = bytes as u64;
        match direction {
            Direction::PrimaryToSecondary => {
                self.bytes_primary_to_secondary.fetch_add(bytes, Ordering::Relaxed);
                self.transfers_primary_to_secondary.fetch_add(1, Ordering::Relaxed);
            }
            Direction::SecondaryToPrimary => {
                self.bytes_secondary_to_primary.fetch_add(bytes, Ordering::Relaxed);
                self.transfers_secondary_to_primary.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.data_relayed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn to_stats(&self) -> SessionStats {
        let up = self.bytes_primary_to_secondary.load(Ordering::Relaxed);
        let down = self.bytes_secondary_to_primary.load(Ordering::Relaxed);
        let transfers_up = self.transfers_primary_to_secondary.load(Ordering::Relaxed);
        let transfers_down = self.transfers_secondary_to_primary.load(Ordering::Relaxed);

        SessionStats {
            session_id: self.session_id.clone(),
            start_time: humantime::format_rfc3339_millis(self.started_at).to_string(),
            duration_ms: self.duration().as_millis() as u64,
            data_relayed: self.data_relayed(),
            bytes_primary_to_secondary: up,
            bytes_secondary_to_primary: down,
            total_bytes: up + down,
            transfers_primary_to_secondary: transfers_up,
            transfers_secondary_to_primary: transfers_down,
            data_transfers: transfers_up + transfers_down,
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.to_stats();

        info!(
            session_id = %stats.session_id,
            duration_ms = stats.duration_ms,
            data_relayed = stats.data_relayed,
            bytes_primary_to_secondary = stats.bytes_primary_to_secondary,
            bytes_secondary_to_primary = stats.bytes_secondary_to_primary,
            data_transfers = stats.data_transfers,
            errors = stats.errors,
            "Relay session finished"
        );

        info!(
            "Session {} finished | Duration: {:?} | P->S: {} bytes | S->P: {} bytes | Transfers: {} | Errors: {}",
            stats.session_id,
            self.duration(),
            stats.bytes_primary_to_secondary,
            stats.bytes_secondary_to_primary,
            stats.data_transfers,
            stats.errors
        );
    }
}

impl Default for RelaySession {
    fn default() -> Self {
        Self::new()
    }
}
