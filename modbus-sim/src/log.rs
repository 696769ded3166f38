//! The operator-facing event log.
//!
//! Servers report requests, responses and errors as plain text lines through a [`LogSink`]. A
//! sink must never block a connection, and the server never expects anything back from it.
//!
//! Sinks that hand lines to an operator prefix them with the local time. [`TracingLog`] leaves that
//! to the subscriber.

use std::{collections::VecDeque, sync::Arc};

use chrono::Local;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Layout of the time prefix, e.g. `2024-05-01 13:37:00`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait LogSink: Send + Sync {
    fn append(&self, text: &str);
}

/// Forwards every line to `tracing` at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLog;

impl LogSink for TracingLog {
    fn append(&self, text: &str) {
        info!(target: "modbus_sim::log", "{text}");
    }
}

/// Keeps the most recent lines, dropping the oldest once `capacity` is reached.
#[derive(Clone, Debug)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for LogBuffer {
    fn append(&self, text: &str) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        if self.capacity > 0 {
            lines.push_back(timestamped(text));
        }
    }
}

/// Hands lines to a UI task. Lines are dropped rather than waited on when the channel is full.
impl LogSink for mpsc::Sender<String> {
    fn append(&self, text: &str) {
        if let Err(err) = self.try_send(timestamped(text)) {
            warn!(%err, "log line dropped");
        }
    }
}

fn timestamped(text: &str) -> String {
    format!("{}: {text}", Local::now().format(TIMESTAMP_FORMAT))
}

/// Space separated upper-case hex, e.g. `00 0A FF`.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn buffer_keeps_most_recent_lines() {
    let log = LogBuffer::new(2);
    log.append("one");
    log.append("two");
    log.append("three");
    let lines = log.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(": two"));
    assert!(lines[1].ends_with(": three"));
    assert!(log.contains("thr"));
    assert!(!log.contains("one"));
}

#[test]
fn zero_capacity_buffer_stays_empty() {
    let log = LogBuffer::new(0);
    log.append("one");
    assert!(log.lines().is_empty());
}

#[tokio::test]
async fn channel_sink_never_blocks() {
    let (tx, mut rx) = mpsc::channel(1);
    tx.append("first");
    tx.append("dropped");
    assert!(rx.recv().await.unwrap().ends_with(": first"));
    assert!(rx.try_recv().is_err());
}

#[test]
fn lines_start_with_local_time() {
    let log = LogBuffer::new(1);
    log.append("client 127.0.0.1:40000 connected");

    let line = &log.lines()[0];
    let (time, text) = line.split_once(": ").unwrap();
    let parsed = chrono::NaiveDateTime::parse_from_str(time, TIMESTAMP_FORMAT);
    assert!(parsed.is_ok(), "{line}");
    assert_eq!(text, "client 127.0.0.1:40000 connected");
}

#[test]
fn formats_hex() {
    assert_eq!(hex(&[0x00, 0x0A, 0xFF]), "00 0A FF");
    assert_eq!(hex(&[]), "");
}
