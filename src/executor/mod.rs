//! Statement executor seam.
//!
//! The scheduling core only needs three things from a backend: open a
//! session against a target, run batch text on it while honoring a shared
//! cancellation token, and report diagnostics as they arrive. Every batch gets
//! its own session; sessions are never shared between batches.

mod diagnostic;
pub mod postgres;
pub mod scripted;

pub use diagnostic::{Diagnostic, Severity};
pub use postgres::{PgExecutor, PgSession};
pub use scripted::{Script, ScriptedBehavior, ScriptedExecutor, ScriptedSession, SessionStats};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::Target;
use crate::narration::Narrator;

/// Terminal failure of a single session call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// Backend reported structured error records
    #[error("backend error: {}", summarize(.0))]
    Backend(Vec<Diagnostic>),

    /// The call observed the cancellation token before completing
    #[error("execution canceled")]
    Canceled,

    /// Anything else that went wrong in the executor layer
    #[error("{0}")]
    Fault(String),
}

pub(crate) fn summarize(records: &[Diagnostic]) -> String {
    let errors: Vec<&str> = records
        .iter()
        .filter(|d| d.is_error())
        .map(|d| d.message.as_str())
        .collect();
    if errors.is_empty() {
        "no error records".to_string()
    } else {
        errors.join("; ")
    }
}

/// Opens sessions against a target
#[async_trait]
pub trait StatementExecutor: Send + Sync + 'static {
    /// Session type produced by this executor
    type Session: Session;

    /// Open a fresh session. Failures surface as the batch's error outcome.
    async fn open(&self, target: &Target) -> Result<Self::Session, ExecutionError>;
}

/// One open backend session, owned by a single batch for one run
#[async_trait]
pub trait Session: Send {
    /// Register the listener that receives diagnostics during execution.
    /// Called before any work is issued.
    fn set_listener(&mut self, listener: DiagnosticListener);

    /// Run the batch text. Cancellation is cooperative: once `cancel` fires
    /// the session should stop as soon as the backend allows and return
    /// [`ExecutionError::Canceled`], but work already past its point of no
    /// return may still finish normally.
    async fn execute(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError>;

    /// Release the session. Dropping a session must also release it.
    async fn close(&mut self) -> Result<(), ExecutionError>;
}

/// Handle a session pushes diagnostics into as they arrive.
///
/// Records are kept in arrival order for the batch and a narration line is
/// queued immediately, so live messages show up before the batch's terminal
/// status.
#[derive(Clone)]
pub struct DiagnosticListener {
    sequence: usize,
    tx: mpsc::UnboundedSender<Diagnostic>,
    narrator: Arc<Narrator>,
}

impl DiagnosticListener {
    pub(crate) fn new(
        sequence: usize,
        narrator: Arc<Narrator>,
    ) -> (Self, mpsc::UnboundedReceiver<Diagnostic>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sequence, tx, narrator }, rx)
    }

    /// Record one diagnostic
    pub fn notify(&self, diagnostic: Diagnostic) {
        self.narrator
            .enqueue(format!("Batch {} InfoMessage: {}", self.sequence, diagnostic.message));
        if self.tx.send(diagnostic).is_err() {
            debug!(batch = self.sequence, "Diagnostic arrived after batch finished");
        }
    }

    /// Sequence number of the batch this listener belongs to
    pub fn sequence(&self) -> usize {
        self.sequence
    }
}

impl std::fmt::Debug for DiagnosticListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticListener")
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narration::MemorySink;

    #[test]
    fn test_listener_keeps_arrival_order_and_narrates() {
        let sink = Arc::new(MemorySink::new());
        let narrator = Arc::new(Narrator::new(sink.clone(), true));
        let (listener, mut rx) = DiagnosticListener::new(7, Arc::clone(&narrator));

        listener.notify(Diagnostic::info("first"));
        listener.notify(Diagnostic::info("second"));
        narrator.flush();

        assert_eq!(rx.try_recv().map(|d| d.message).ok(), Some("first".to_string()));
        assert_eq!(rx.try_recv().map(|d| d.message).ok(), Some("second".to_string()));
        assert_eq!(
            sink.lines(),
            vec!["Batch 7 InfoMessage: first", "Batch 7 InfoMessage: second"]
        );
    }

    #[test]
    fn test_backend_error_summary_skips_informational_records() {
        let err = ExecutionError::Backend(vec![
            Diagnostic::info("(1 rows affected)"),
            Diagnostic::error("relation \"missing\" does not exist"),
        ]);
        assert_eq!(err.to_string(), "backend error: relation \"missing\" does not exist");
    }
}
