//! RelayBridge Library
//!
//! Bridges a TCP socket to a serial port or a second TCP socket for one
//! polling session, then reports how the session went.

pub mod config;
pub mod connection;
pub mod error;
pub mod relay;
pub mod report;
pub mod retry;
pub mod shutdown;

pub use config::Config;
pub use relay::RelayService;
pub use retry::{RetryHandler, RetryPolicy};
pub use shutdown::ShutdownOrchestrator;

/// Common error type for application glue
pub type Result<T> = anyhow::Result<T>;
