use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use super::{ProgressSink, SinkError};

/// Writes narration to the tracing pipeline at INFO level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn send(&self, line: &str) -> Result<(), SinkError> {
        info!(target: "parallel_sql::narration", "{}", line);
        Ok(())
    }
}

/// Message pipe backed by an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    /// Create the sink and the receiving end of the pipe
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn send(&self, line: &str) -> Result<(), SinkError> {
        self.tx
            .send(line.to_string())
            .map_err(|_| SinkError("receiver dropped".to_string()))
    }
}

/// Collects lines in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Index of the first line equal to `line`
    pub fn position(&self, line: &str) -> Option<usize> {
        self.lines.lock().iter().position(|l| l == line)
    }

    /// Whether any delivered line contains `fragment`
    pub fn contains(&self, fragment: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(fragment))
    }
}

impl ProgressSink for MemorySink {
    fn send(&self, line: &str) -> Result<(), SinkError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}
