use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-run shared state: an identity for tracing and the single
/// cancellation signal every batch of the run observes.
///
/// Cancelling is idempotent and the signal is never reset.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    cancel: CancellationToken,
}

impl RunContext {
    /// Fresh context with an untriggered signal
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    /// Run identifier
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The shared signal
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Trigger the signal
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the signal has been triggered
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
