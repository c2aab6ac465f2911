//! Ordered progress narration.
//!
//! Any number of batch tasks may queue lines concurrently; the controller
//! flushes at explicit points. Delivery is best effort and a failing sink
//! never fails the run.

mod sinks;

pub use sinks::{ChannelSink, MemorySink, TracingSink};

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

/// Sink delivery failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("progress sink error: {0}")]
pub struct SinkError(pub String);

/// External observer of progress lines
pub trait ProgressSink: Send + Sync {
    /// Deliver one line
    fn send(&self, line: &str) -> Result<(), SinkError>;
}

/// Many-writer FIFO queue in front of a [`ProgressSink`]
pub struct Narrator {
    enabled: bool,
    queue: Mutex<VecDeque<String>>,
    // Serializes flushers so lines leave in queue order.
    flush_lock: Mutex<()>,
    sink: Arc<dyn ProgressSink>,
}

impl Narrator {
    /// Create a narrator. A disabled narrator drops every line.
    pub fn new(sink: Arc<dyn ProgressSink>, enabled: bool) -> Self {
        Self {
            enabled,
            queue: Mutex::new(VecDeque::new()),
            flush_lock: Mutex::new(()),
            sink,
        }
    }

    /// Narrator that produces nothing
    pub fn disabled() -> Self {
        Self::new(Arc::new(TracingSink), false)
    }

    /// Whether lines are being produced
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue a line without delivering it
    pub fn enqueue(&self, line: impl Into<String>) {
        if self.enabled {
            self.queue.lock().push_back(line.into());
        }
    }

    /// Queue a line and flush everything queued so far
    pub fn say(&self, line: impl Into<String>) {
        self.enqueue(line);
        self.flush();
    }

    /// Deliver every queued line in FIFO order
    pub fn flush(&self) {
        if !self.enabled {
            return;
        }
        let _guard = self.flush_lock.lock();
        loop {
            let next = self.queue.lock().pop_front();
            let Some(line) = next else { break };
            if let Err(e) = self.sink.send(&line) {
                warn!(error = %e, "Dropping narration line");
            }
        }
    }

    /// Number of lines waiting for the next flush
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

impl std::fmt::Debug for Narrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Narrator")
            .field("enabled", &self.enabled)
            .field("queued", &self.queued())
            .finish()
    }
}
