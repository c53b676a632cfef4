//! Run Reporting
//!
//! Final status record, HTTP sinks and in-memory log capture.

pub mod log_buffer;
pub mod sink;
pub mod status;

pub use log_buffer::{LogBuffer, LogEntry};
pub use sink::{sinks_from_config, HttpLogSink, HttpStatusSink, LogSink, ReportError, StatusSink};
pub use status::{StatusMetrics, StatusRecord};
