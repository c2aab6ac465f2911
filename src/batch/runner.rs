//! Drives one batch through a statement executor and derives its outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::batch::types::{BatchFailure, BatchOutcome, BatchRequest};
use crate::executor::{DiagnosticListener, ExecutionError, Session, StatementExecutor};
use crate::narration::Narrator;

/// Runs single batches; shared by every execution task of a run
pub struct BatchRunner<E: StatementExecutor> {
    executor: Arc<E>,
    narrator: Arc<Narrator>,
}

impl<E: StatementExecutor> BatchRunner<E> {
    /// Create a runner over `executor`, narrating into `narrator`
    pub fn new(executor: Arc<E>, narrator: Arc<Narrator>) -> Self {
        Self { executor, narrator }
    }

    /// Execute `batch` to a terminal outcome, mutating it in place.
    ///
    /// Outcome priority: backend error records, then observed cancellation,
    /// then any other fault, otherwise completed. The end time is always
    /// recorded and the session always released. A panic in the executor
    /// becomes a fault; diagnostics received before it are kept.
    #[instrument(skip_all, fields(batch = batch.sequence()))]
    pub async fn run(&self, batch: &mut BatchRequest, cancel: &CancellationToken) {
        let (listener, mut diagnostics) =
            DiagnosticListener::new(batch.sequence(), Arc::clone(&self.narrator));

        let ran = AssertUnwindSafe(self.execute(batch, listener, cancel))
            .catch_unwind()
            .await;
        let result = ran.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Execution panicked");
            Err(ExecutionError::Fault(format!("execution task panicked: {message}")))
        });

        while let Ok(diagnostic) = diagnostics.try_recv() {
            batch.push_diagnostic(diagnostic);
        }

        match result {
            Ok(()) => {
                batch.set_outcome(BatchOutcome::Completed);
            }
            Err(ExecutionError::Backend(records)) => {
                for record in &records {
                    batch.push_diagnostic(record.clone());
                }
                batch.fail(BatchFailure::Backend { records });
            }
            Err(ExecutionError::Canceled) => {
                batch.set_outcome(BatchOutcome::Canceled);
            }
            Err(ExecutionError::Fault(message)) => {
                batch.fail(BatchFailure::Fault { message });
            }
        }
        batch.mark_ended();

        debug!(
            outcome = ?batch.outcome(),
            diagnostics = batch.diagnostics().len(),
            "Batch finished"
        );
    }

    async fn execute(
        &self,
        batch: &mut BatchRequest,
        listener: DiagnosticListener,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let mut session = self.executor.open(batch.target()).await?;
        session.set_listener(listener);

        batch.mark_started();
        let result = session.execute(batch.text(), cancel).await;

        if let Err(e) = session.close().await {
            warn!(batch = batch.sequence(), error = %e, "Failed to close session");
        }
        result
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<E: StatementExecutor> std::fmt::Debug for BatchRunner<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("narrator", &self.narrator)
            .finish()
    }
}
