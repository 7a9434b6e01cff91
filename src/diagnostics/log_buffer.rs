//! Bounded in-memory log buffer fed by a `tracing` layer.
//!
//! [`LogBuffer`] keeps the last N records (oldest dropped first) so a host UI
//! can show recent activity without reading log files. It is injected where
//! needed rather than living in a global.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub at: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    /// Message followed by any structured fields as `key=value`.
    pub message: String,
}

#[derive(Debug)]
struct Ring {
    records: VecDeque<LogRecord>,
    capacity: usize,
    dropped: u64,
}

/// Fixed-capacity, drop-oldest record buffer. Clones share the same ring.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    ring: Arc<Mutex<Ring>>,
}

impl LogBuffer {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Arc::new(Mutex::new(Ring {
                records: VecDeque::with_capacity(capacity),
                capacity,
                dropped: 0,
            })),
        }
    }

    pub fn push(&self, record: LogRecord) {
        let mut ring = self.lock();
        if ring.records.len() == ring.capacity {
            ring.records.pop_front();
            ring.dropped += 1;
        }
        ring.records.push_back(record);
    }

    /// Copy of the buffered records, oldest first.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Records evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn clear(&self) {
        self.lock().records.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `tracing_subscriber` layer copying every event into a [`LogBuffer`].
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl LogBufferLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.buffer.push(LogRecord {
            at: Utc::now(),
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={value:?}", field.name());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            at: Utc::now(),
            level: Level::INFO,
            target: "test".into(),
            message: message.into(),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(record(&format!("line {i}")));
        }
        let messages: Vec<String> = buffer.snapshot().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn clones_share_the_ring() {
        let buffer = LogBuffer::new(10);
        let reader = buffer.clone();
        buffer.push(record("hello"));
        assert_eq!(reader.len(), 1);
        reader.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_one() {
        let buffer = LogBuffer::new(0);
        buffer.push(record("a"));
        buffer.push(record("b"));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.snapshot()[0].message, "b");
    }

    #[test]
    fn layer_captures_message_and_fields() {
        let buffer = LogBuffer::new(10);
        let subscriber =
            tracing_subscriber::registry().with(LogBufferLayer::new(buffer.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(surface = "intro", attempt = 2, "pause not confirmed");
        });
        let records = buffer.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::WARN);
        assert_eq!(
            records[0].message,
            "pause not confirmed surface=\"intro\" attempt=2"
        );
    }
}
