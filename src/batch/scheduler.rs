//! Bounded-concurrency dispatch loop.
//!
//! The scheduler is the only place that touches `pending`, `running` and
//! `completed`. Each admitted batch is moved into its own task and handed back
//! when the task ends, so a batch has exactly one owner at any time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::batch::context::RunContext;
use crate::batch::runner::BatchRunner;
use crate::batch::types::{BatchFailure, BatchOutcome, BatchRequest};
use crate::executor::StatementExecutor;
use crate::narration::Narrator;
use crate::{ParallelSqlError, Result};

/// Default bound on one wait-any
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default bound on one cascade drain attempt
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(5);

/// Runs batches at most `degree_of_parallelism` at a time and cascades the
/// first failure
pub struct Scheduler<E: StatementExecutor> {
    pub(super) runner: Arc<BatchRunner<E>>,
    pub(super) narrator: Arc<Narrator>,
    pub(super) context: RunContext,
    pub(super) poll_interval: Duration,
    pub(super) drain_interval: Duration,
    pub(super) pending: VecDeque<BatchRequest>,
    pub(super) running: JoinSet<BatchRequest>,
    pub(super) completed: Vec<BatchRequest>,
    pub(super) lost_tasks: usize,
    peak_running: usize,
}

impl<E: StatementExecutor> Scheduler<E> {
    /// Create a scheduler for one run
    pub fn new(runner: Arc<BatchRunner<E>>, narrator: Arc<Narrator>, context: RunContext) -> Self {
        Self {
            runner,
            narrator,
            context,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            pending: VecDeque::new(),
            running: JoinSet::new(),
            completed: Vec::new(),
            lost_tasks: 0,
            peak_running: 0,
        }
    }

    /// Set the wait-any bound
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the cascade drain-attempt bound
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Run every batch, admitting in order, at most `degree_of_parallelism`
    /// at once.
    ///
    /// Returns the first batch failure once every started batch has reached
    /// a terminal outcome. Batches still pending at that point never start.
    #[instrument(
        skip_all,
        fields(
            run_id = %self.context.run_id(),
            batches = batches.len(),
            dop = degree_of_parallelism
        )
    )]
    pub async fn run_all(
        &mut self,
        batches: Vec<BatchRequest>,
        degree_of_parallelism: usize,
    ) -> Result<()> {
        if degree_of_parallelism == 0 {
            return Err(ParallelSqlError::Config(
                "degree_of_parallelism must be at least 1".to_string(),
            ));
        }
        self.pending.extend(batches);
        info!(pending = self.pending.len(), "Starting scheduler");

        while !self.pending.is_empty() || !self.running.is_empty() {
            self.admit(degree_of_parallelism);

            let joined = tokio::time::timeout(self.poll_interval, self.running.join_next()).await;
            self.narrator.flush();

            let batch = match joined {
                Err(_) | Ok(None) => continue,
                Ok(Some(Ok(batch))) => batch,
                Ok(Some(Err(join_error))) => {
                    error!(error = %join_error, "Execution task failed to join");
                    self.lost_tasks += 1;
                    self.narrator.say(format!("Execution task failed: {join_error}"));
                    self.cascade().await;
                    return Err(ParallelSqlError::Join(join_error));
                }
            };

            match batch.outcome() {
                Some(BatchOutcome::Error) | None => {
                    let sequence = batch.sequence();
                    let failure = batch.failure().cloned().unwrap_or_else(|| BatchFailure::Fault {
                        message: "execution ended without an outcome".to_string(),
                    });
                    error!(batch = sequence, error = %failure, "Batch failed, cancelling run");
                    self.narrate_failure(&batch, &failure);
                    self.completed.push(batch);

                    self.cascade().await;
                    return Err(ParallelSqlError::Batch { sequence, failure });
                }
                Some(BatchOutcome::Canceled) => {
                    info!(batch = batch.sequence(), "Batch canceled");
                    self.narrator
                        .say(format!("{} Canceled. Duration {} sec", batch, batch.duration_secs()));
                    self.completed.push(batch);
                }
                Some(BatchOutcome::Completed) => {
                    let duration = batch.duration_secs();
                    info!(batch = batch.sequence(), duration_secs = duration, "Batch completed");
                    self.narrator
                        .say(format!("{batch} Completed. Duration {duration} sec"));
                    self.completed.push(batch);
                }
            }
        }

        self.narrator.flush();
        info!(completed = self.completed.len(), "All batches finished");
        Ok(())
    }

    fn admit(&mut self, degree_of_parallelism: usize) {
        while self.running.len() < degree_of_parallelism {
            let Some(batch) = self.pending.pop_front() else { break };
            let sequence = batch.sequence();

            self.narrator.say(format!("-------Starting Batch {sequence} --------"));
            self.narrator.say(batch.text());
            self.narrator.say(format!("-------End Batch {sequence} Listing --------"));

            let runner = Arc::clone(&self.runner);
            let cancel = self.context.token().clone();
            self.running.spawn(async move {
                let mut batch = batch;
                runner.run(&mut batch, &cancel).await;
                batch
            });
            self.peak_running = self.peak_running.max(self.running.len());
            debug!(batch = sequence, running = self.running.len(), "Batch admitted");

            self.narrator.flush();
        }
    }

    fn narrate_failure(&self, batch: &BatchRequest, failure: &BatchFailure) {
        self.narrator.say(format!("{batch} Failed: {failure}"));
        self.narrator.say("-----------Failed batch Output--------------");
        for diagnostic in batch.diagnostics() {
            self.narrator.say(diagnostic.to_string());
        }
        self.narrator.say("-----------Failed batch Output--------------");
    }

    /// Batches in completion order
    pub fn completed(&self) -> &[BatchRequest] {
        &self.completed
    }

    /// Batches never admitted
    pub fn pending(&self) -> impl Iterator<Item = &BatchRequest> {
        self.pending.iter()
    }

    /// Number of batches never admitted
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of executions still in flight
    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Largest running set observed
    pub fn peak_running(&self) -> usize {
        self.peak_running
    }

    /// Execution tasks that ended without handing their batch back
    pub fn lost_tasks(&self) -> usize {
        self.lost_tasks
    }

    /// The run's shared context
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Consume the scheduler, returning completed and never-started batches
    pub fn into_parts(self) -> (Vec<BatchRequest>, Vec<BatchRequest>) {
        (self.completed, self.pending.into_iter().collect())
    }
}

impl<E: StatementExecutor> std::fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_id", &self.context.run_id())
            .field("pending", &self.pending.len())
            .field("running", &self.running.len())
            .field("completed", &self.completed.len())
            .field("lost_tasks", &self.lost_tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Target;
    use crate::executor::ScriptedExecutor;

    fn scheduler() -> Scheduler<ScriptedExecutor> {
        let narrator = Arc::new(Narrator::disabled());
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = Arc::new(BatchRunner::new(executor, Arc::clone(&narrator)));
        Scheduler::new(runner, narrator, RunContext::new())
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_zero_parallelism_is_rejected() {
        let mut scheduler = scheduler();
        let target = Target::new("postgres://localhost/main");
        let batches = vec![BatchRequest::new(0, "SELECT 1", target)];

        let err = scheduler.run_all(batches, 0).await.unwrap_err();
        assert!(matches!(err, ParallelSqlError::Config(_)));
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_empty_run_returns_immediately() {
        let mut scheduler = scheduler();
        scheduler.run_all(Vec::new(), 4).await.unwrap();

        assert!(scheduler.completed().is_empty());
        assert_eq!(scheduler.peak_running(), 0);
        assert!(!scheduler.context().is_cancelled());
    }
}
