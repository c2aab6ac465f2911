//! Cancel-and-drain protocol run once, on the first batch failure.
//!
//! The wait is unbounded overall: every started batch must reach a terminal
//! outcome before the failure is returned. Only each wait attempt is bounded,
//! so progress can be narrated while slow batches wind down.

use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::batch::scheduler::Scheduler;
use crate::batch::types::{BatchOutcome, BatchRequest};
use crate::executor::StatementExecutor;

impl<E: StatementExecutor> Scheduler<E> {
    #[instrument(skip_all, fields(run_id = %self.context.run_id(), running = self.running.len()))]
    pub(super) async fn cascade(&mut self) {
        warn!(
            running = self.running.len(),
            pending = self.pending.len(),
            "Cancelling running batches"
        );
        self.context.cancel();

        let mut deadline = Instant::now() + self.drain_interval;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.running.join_next()).await {
                Ok(Some(Ok(batch))) => self.record_drained(batch),
                Ok(Some(Err(join_error))) => {
                    error!(error = %join_error, "Execution task failed to join during drain");
                    self.lost_tasks += 1;
                    self.narrator.enqueue(format!(
                        "Execution task failed during cancellation: {join_error}"
                    ));
                }
                Ok(None) => break,
                Err(_) => {
                    self.narrator.flush();
                    self.narrator.say("Waiting for completion of canceled batches");
                    info!(running = self.running.len(), "Still draining canceled batches");
                    deadline = Instant::now() + self.drain_interval;
                }
            }
        }

        self.narrator.flush();
        info!(
            completed = self.completed.len(),
            never_started = self.pending.len(),
            lost = self.lost_tasks,
            "Drain complete"
        );
    }

    fn record_drained(&mut self, batch: BatchRequest) {
        match batch.outcome() {
            Some(BatchOutcome::Canceled) => {
                self.narrator
                    .enqueue(format!("{} Canceled. Duration {} sec", batch, batch.duration_secs()));
            }
            Some(BatchOutcome::Completed) => {
                let duration = batch.duration_secs();
                self.narrator
                    .enqueue(format!("{batch} Completed. Duration {duration} sec"));
            }
            Some(BatchOutcome::Error) | None => {
                // Only the triggering failure is returned; later ones are
                // narrated and kept on the batch.
                let reason = batch
                    .failure()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "no outcome".to_string());
                warn!(batch = batch.sequence(), error = %reason, "Batch failed while draining");
                self.narrator.enqueue(format!("{batch} Failed during cancellation: {reason}"));
            }
        }
        self.completed.push(batch);
    }
}
