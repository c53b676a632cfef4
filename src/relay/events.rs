//! Relay lifecycle events

use std::fmt;

use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use super::session::RelayStats;
use crate::connection::ClientType;

/// Which way bytes crossed the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    PrimaryToSecondary,
    SecondaryToPrimary,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::PrimaryToSecondary => write!(f, "primary->secondary"),
            Direction::SecondaryToPrimary => write!(f, "secondary->primary"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Started { session_id: String },
    /// Emitted once per session, on the first successful forward
    FirstDataRelayed { direction: Direction },
    DataRelayed { direction: Direction, bytes: usize },
    /// A single forward failed; the session keeps running
    RelayError { direction: Direction, error: String },
    ClientDisconnected { client_type: ClientType, info: String },
    /// Deadline passed with nothing relayed
    Timeout { reason: String },
    /// Deadline passed after at least one byte crossed
    Completed { reason: String },
    Stopped {
        success: bool,
        reason: String,
        stats: RelayStats,
    },
}

impl RelayEvent {
    /// Success flag carried by terminal events
    pub fn success(&self) -> Option<bool> {
        match self {
            RelayEvent::Timeout { .. } => Some(false),
            RelayEvent::Completed { .. } => Some(true),
            RelayEvent::Stopped { success, .. } => Some(*success),
            _ => None,
        }
    }
}

/// Terminal classification of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Timeout { reason: String },
    Completed { reason: String },
    Stopped { success: bool, reason: String },
}

impl SessionOutcome {
    pub fn from_event(event: &RelayEvent) -> Option<Self> {
        match event {
            RelayEvent::Timeout { reason } => Some(SessionOutcome::Timeout {
                reason: reason.clone(),
            }),
            RelayEvent::Completed { reason } => Some(SessionOutcome::Completed {
                reason: reason.clone(),
            }),
            RelayEvent::Stopped { success, reason, .. } => Some(SessionOutcome::Stopped {
                success: *success,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        match self {
            SessionOutcome::Timeout { .. } => false,
            SessionOutcome::Completed { .. } => true,
            SessionOutcome::Stopped { success, .. } => *success,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            SessionOutcome::Timeout { reason }
            | SessionOutcome::Completed { reason }
            | SessionOutcome::Stopped { reason, .. } => reason,
        }
    }
}

/// Wait for the first terminal event on `events`.
///
/// Returns `None` if the channel closes before the session ends.
pub async fn wait_for_outcome(events: broadcast::Receiver<RelayEvent>) -> Option<SessionOutcome> {
    let mut stream = BroadcastStream::new(events);
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(outcome) = SessionOutcome::from_event(&event) {
                    return Some(outcome);
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Relay event listener lagged, skipped {} events", skipped);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_outcome_skips_progress_events() {
        let (tx, rx) = broadcast::channel(16);
        tx.send(RelayEvent::Started {
            session_id: "s".to_string(),
        })
        .unwrap();
        tx.send(RelayEvent::DataRelayed {
            direction: Direction::PrimaryToSecondary,
            bytes: 3,
        })
        .unwrap();
        tx.send(RelayEvent::Completed {
            reason: "done".to_string(),
        })
        .unwrap();

        let outcome = wait_for_outcome(rx).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.reason(), "done");
    }

    #[tokio::test]
    async fn test_wait_for_outcome_closed_channel() {
        let (tx, rx) = broadcast::channel::<RelayEvent>(4);
        drop(tx);
        assert!(wait_for_outcome(rx).await.is_none());
    }

    #[test]
    fn test_terminal_success_flags() {
        let timeout = RelayEvent::Timeout {
            reason: "no data".to_string(),
        };
        assert_eq!(timeout.success(), Some(false));
        assert_eq!(
            RelayEvent::FirstDataRelayed {
                direction: Direction::SecondaryToPrimary
            }
            .success(),
            None
        );
        assert_eq!(Direction::PrimaryToSecondary.to_string(), "primary->secondary");
    }
}
