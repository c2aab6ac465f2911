//! Public entry point: resolve the target, build the catalog, run it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchRequest, BatchRunner, RunContext, Scheduler};
use crate::catalog::{build_catalog, CatalogSource, Target, TargetResolver};
use crate::config::RunConfig;
use crate::executor::StatementExecutor;
use crate::narration::{Narrator, ProgressSink, TracingSink};
use crate::Result;

/// Outcome counts for a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Batches in the catalog
    pub total: usize,
    /// Batches that completed
    pub completed: usize,
    /// Batches that observed cancellation
    pub canceled: usize,
    /// Batches that ended in error
    pub failed: usize,
    /// Batches never admitted
    pub not_started: usize,
    /// Wall-clock duration of the scheduling phase
    pub duration: Duration,
}

impl RunSummary {
    fn from_batches(completed: &[BatchRequest], not_started: usize, duration: Duration) -> Self {
        let count = |outcome: BatchOutcome| {
            completed
                .iter()
                .filter(|b| b.outcome() == Some(outcome))
                .count()
        };
        Self {
            total: completed.len() + not_started,
            completed: count(BatchOutcome::Completed),
            canceled: count(BatchOutcome::Canceled),
            failed: count(BatchOutcome::Error),
            not_started,
            duration,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} batches: {} completed, {} canceled, {} failed, {} not started in {:.3}s",
            self.total,
            self.completed,
            self.canceled,
            self.failed,
            self.not_started,
            self.duration.as_secs_f64()
        )
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identifier, also recorded on the tracing span
    pub run_id: Uuid,
    /// Every batch, in completion order
    pub batches: Vec<BatchRequest>,
    /// Outcome counts
    pub summary: RunSummary,
}

/// One parallel execution of a batch catalog
pub struct ParallelExecution<C, E>
where
    C: CatalogSource + TargetResolver,
    E: StatementExecutor,
{
    catalog: C,
    executor: Arc<E>,
    sink: Arc<dyn ProgressSink>,
    config: RunConfig,
    target: Option<Target>,
}

impl<C, E> ParallelExecution<C, E>
where
    C: CatalogSource + TargetResolver,
    E: StatementExecutor,
{
    /// Create an execution reading batches from `catalog` and running them
    /// through `executor`
    pub fn new(catalog: C, executor: Arc<E>) -> Self {
        Self {
            catalog,
            executor,
            sink: Arc::new(TracingSink),
            config: RunConfig::default(),
            target: None,
        }
    }

    /// Deliver narration to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use `config`
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Explicit target; skips default target resolution
    pub fn with_target(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Run every batch returned by `query`.
    ///
    /// Fails with the first batch error after every started batch has
    /// finished, or with a catalog error before anything starts. The error
    /// text is sent to the sink as the last line whether or not narration
    /// is enabled.
    pub async fn run(&self, query: &str) -> Result<RunReport> {
        let context = RunContext::new();
        let narrator = Arc::new(Narrator::new(Arc::clone(&self.sink), self.config.debug_narration));
        let span = info_span!(
            "parallel_run",
            run_id = %context.run_id(),
            dop = self.config.degree_of_parallelism
        );

        async {
            match self.run_inner(query, context, &narrator).await {
                Ok(report) => Ok(report),
                Err(e) => {
                    error!(error = %e, "Parallel run failed");
                    narrator.flush();
                    // Delivered even with narration off.
                    if let Err(sink_error) = self.sink.send(&e.to_string()) {
                        warn!(error = %sink_error, "Could not deliver failure text");
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        query: &str,
        context: RunContext,
        narrator: &Arc<Narrator>,
    ) -> Result<RunReport> {
        self.config.validate()?;

        let target = match &self.target {
            Some(target) => target.clone(),
            None => {
                let target = self.catalog.resolve_default().await?;
                narrator.say(format!("Using target: {target}"));
                target
            }
        };

        let rows = self.catalog.fetch(query).await?;
        let batches = build_catalog(rows, &target)?;
        info!(batches = batches.len(), target = %target, "Catalog ready");

        let run_id = context.run_id();
        let runner = Arc::new(BatchRunner::new(Arc::clone(&self.executor), Arc::clone(narrator)));
        let mut scheduler = Scheduler::new(runner, Arc::clone(narrator), context)
            .with_poll_interval(self.config.poll_interval)
            .with_drain_interval(self.config.drain_interval);

        let started = Instant::now();
        scheduler.run_all(batches, self.config.degree_of_parallelism).await?;
        let (batches, not_started) = scheduler.into_parts();

        let summary = RunSummary::from_batches(&batches, not_started.len(), started.elapsed());
        info!(%summary, "Parallel run finished");
        Ok(RunReport {
            run_id,
            batches,
            summary,
        })
    }
}

impl<C, E> fmt::Debug for ParallelExecution<C, E>
where
    C: CatalogSource + TargetResolver,
    E: StatementExecutor,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelExecution")
            .field("config", &self.config)
            .field("target", &self.target)
            .finish()
    }
}
