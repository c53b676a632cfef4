//! Log capture layer
//!
//! Keeps the most recent tracing events in memory so they can be uploaded
//! when the process shuts down.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// Bounded ring buffer of log entries; oldest entries are evicted first
#[derive(Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: Arc<AtomicUsize>,
    evicted: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity: Arc::new(AtomicUsize::new(capacity)),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Change the capacity; excess entries are evicted on the next push
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn push(&self, entry: LogEntry) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut entries = self.entries.lock();
        while entries.len() >= capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Take every buffered entry, leaving the buffer empty
    pub fn drain(&self) -> Vec<LogEntry> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries dropped because the buffer was full
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.fields.insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

impl<S> Layer<S> for LogBuffer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.push(LogEntry {
            timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: String::new(),
            level: "INFO".to_string(),
            target: "test".to_string(),
            message: message.to_string(),
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let buffer = LogBuffer::new(2);
        buffer.push(entry("one"));
        buffer.push(entry("two"));
        buffer.push(entry("three"));

        let messages: Vec<_> = buffer.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(buffer.evicted(), 1);

        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_empty());

        buffer.set_capacity(0);
        buffer.push(entry("four"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.evicted(), 2);
    }

    #[test]
    fn test_layer_captures_message_and_fields() {
        let buffer = LogBuffer::new(10);
        let subscriber = tracing_subscriber::registry().with(buffer.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(client = "tcp", bytes = 9, "Relay error: {}", "broken pipe");
        });

        let entries = buffer.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "WARN");
        assert_eq!(entries[0].message, "Relay error: broken pipe");
        assert_eq!(entries[0].fields.get("client").map(String::as_str), Some("tcp"));
        assert_eq!(entries[0].fields.get("bytes").map(String::as_str), Some("9"));
    }
}
