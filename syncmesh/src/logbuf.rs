//! In-memory log ring buffer
//!
//! A bounded buffer of recent log events backing the `logs` push channel.
//! Installed as a `tracing` layer next to the normal fmt subscriber.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: u64,
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity: capacity.max(1),
        })
    }

    pub fn push(&self, line: LogLine) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Most recent `n` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogLine> {
        let lines = self.lines.lock();
        lines.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// `tracing` layer feeding the buffer.
pub struct BufferLayer {
    buffer: Arc<LogBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        self.buffer.push(LogLine {
            timestamp,
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(msg: &str) -> LogLine {
        LogLine {
            timestamp: 0,
            level: "INFO".into(),
            target: "test".into(),
            message: msg.into(),
        }
    }

    #[test]
    fn buffer_is_bounded_and_ordered() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(line(&format!("m{}", i)));
        }
        assert_eq!(buffer.len(), 3);

        let recent = buffer.recent(10);
        let messages: Vec<&str> = recent.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn recent_takes_the_tail() {
        let buffer = LogBuffer::new(10);
        for i in 0..6 {
            buffer.push(line(&format!("m{}", i)));
        }
        let recent = buffer.recent(2);
        let messages: Vec<&str> = recent.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["m4", "m5"]);
    }
}
