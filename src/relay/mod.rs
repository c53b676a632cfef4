//! Data Relay Module
//!
//! Bridges the primary and secondary clients for one polling session.

pub mod events;
pub mod service;
pub mod session;

pub use events::{wait_for_outcome, Direction, RelayEvent, SessionOutcome};
pub use service::{RelayService, StartError};
pub use session::{RelaySession, RelayStats, SessionStats};
