//! Scheduler and failure cascade tests
//!
//! Drives the dispatch loop against the scripted executor and checks the
//! parallelism cap, outcome bookkeeping, the cancel-and-drain protocol and
//! narration ordering.

use std::sync::Arc;
use std::time::Duration;

use parallel_sql::batch::{
    BatchFailure, BatchOutcome, BatchRequest, BatchRunner, RunContext, Scheduler,
};
use parallel_sql::catalog::Target;
use parallel_sql::executor::{Diagnostic, ExecutionError, Script, ScriptedExecutor, SessionStats};
use parallel_sql::narration::{MemorySink, Narrator};
use parallel_sql::ParallelSqlError;
use pretty_assertions::assert_eq;

const SLOW: Duration = Duration::from_secs(10);

struct Harness {
    scheduler: Scheduler<ScriptedExecutor>,
    stats: Arc<SessionStats>,
    sink: Arc<MemorySink>,
}

fn harness(executor: ScriptedExecutor) -> Harness {
    let sink = Arc::new(MemorySink::new());
    let narrator = Arc::new(Narrator::new(sink.clone(), true));
    let stats = executor.stats();
    let runner = Arc::new(BatchRunner::new(Arc::new(executor), Arc::clone(&narrator)));
    let scheduler = Scheduler::new(runner, narrator, RunContext::new())
        .with_poll_interval(Duration::from_millis(10))
        .with_drain_interval(Duration::from_millis(30));
    Harness { scheduler, stats, sink }
}

fn batches(count: usize) -> Vec<BatchRequest> {
    (0..count)
        .map(|i| BatchRequest::new(i, format!("b{i}"), Target::new("postgres://localhost/main")))
        .collect()
}

fn outcome_of(scheduler: &Scheduler<ScriptedExecutor>, sequence: usize) -> Option<BatchOutcome> {
    scheduler
        .completed()
        .iter()
        .find(|b| b.sequence() == sequence)
        .and_then(|b| b.outcome())
}

#[tokio::test]
async fn test_all_batches_succeed_within_parallelism() {
    let executor = ScriptedExecutor::new()
        .with_default_script(Script::succeed().with_delay(Duration::from_millis(10)));
    let mut h = harness(executor);

    h.scheduler
        .run_all(batches(5), 2)
        .await
        .expect("all batches should succeed");

    assert_eq!(h.scheduler.completed().len(), 5);
    assert!(h
        .scheduler
        .completed()
        .iter()
        .all(|b| b.outcome() == Some(BatchOutcome::Completed)));
    assert_eq!(h.scheduler.pending_len(), 0);
    assert_eq!(h.scheduler.running_len(), 0);
    assert_eq!(h.scheduler.peak_running(), 2);
    assert!(h.stats.peak_open_sessions() <= 2);
    assert_eq!(h.stats.opened(), 5);
    assert_eq!(h.stats.closed(), 5);
    assert!(!h.scheduler.context().is_cancelled());
}

#[tokio::test]
async fn test_first_failure_cancels_running_and_skips_pending() {
    let executor = ScriptedExecutor::new()
        .with_script("b0", Script::succeed().with_delay(SLOW))
        .with_script(
            "b1",
            Script::backend_error(vec![Diagnostic::error("boom").with_line(2)])
                .with_delay(Duration::from_millis(30)),
        )
        .with_script("b2", Script::succeed().with_delay(SLOW));
    let mut h = harness(executor);

    let err = h
        .scheduler
        .run_all(batches(5), 3)
        .await
        .expect_err("run should fail");

    match err {
        ParallelSqlError::Batch { sequence, failure } => {
            assert_eq!(sequence, 1);
            assert!(matches!(
                failure,
                BatchFailure::Backend { ref records } if records[0].message == "boom"
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(h.scheduler.context().is_cancelled());
    assert_eq!(outcome_of(&h.scheduler, 1), Some(BatchOutcome::Error));
    assert_eq!(outcome_of(&h.scheduler, 0), Some(BatchOutcome::Canceled));
    assert_eq!(outcome_of(&h.scheduler, 2), Some(BatchOutcome::Canceled));
    assert_eq!(h.scheduler.running_len(), 0);

    let never_started: Vec<usize> = h.scheduler.pending().map(|b| b.sequence()).collect();
    assert_eq!(never_started, vec![3, 4]);
    assert!(h.scheduler.pending().all(|b| b.is_pending()));
    assert_eq!(h.stats.executed().len(), 3);
    assert!(!h.stats.executed().contains(&"b3".to_string()));
    assert_eq!(h.stats.open_sessions(), 0);

    assert!(h.sink.position("Batch 1 Failed: boom").is_some());
    assert!(h.sink.position("Error boom Line 2 Severity ERROR").is_some());
}

#[tokio::test]
async fn test_reraised_error_is_the_first_even_if_others_fail_while_draining() {
    let executor = ScriptedExecutor::new()
        .with_script(
            "b0",
            Script::backend_error(vec![Diagnostic::error("late failure")])
                .with_delay(Duration::from_millis(150))
                .ignoring_cancel(),
        )
        .with_script("b1", Script::fault("first failure").with_delay(Duration::from_millis(10)));
    let mut h = harness(executor);

    let err = h.scheduler.run_all(batches(2), 2).await.unwrap_err();

    assert_eq!(err.batch_sequence(), Some(1));
    assert_eq!(err.to_string(), "Batch 1 failed: first failure");
    assert_eq!(outcome_of(&h.scheduler, 0), Some(BatchOutcome::Error));
    assert!(h.sink.contains("Batch 0 Failed during cancellation: late failure"));
}

#[tokio::test]
async fn test_drain_waits_for_batches_past_point_of_no_return() {
    let executor = ScriptedExecutor::new()
        .with_script(
            "b0",
            Script::succeed()
                .with_delay(Duration::from_millis(200))
                .ignoring_cancel(),
        )
        .with_script("b1", Script::fault("broken").with_delay(Duration::from_millis(10)));
    let mut h = harness(executor);

    let err = h.scheduler.run_all(batches(2), 2).await.unwrap_err();

    assert_eq!(err.batch_sequence(), Some(1));
    assert_eq!(outcome_of(&h.scheduler, 0), Some(BatchOutcome::Completed));
    assert!(h.sink.contains("Waiting for completion of canceled batches"));
    assert_eq!(h.stats.open_sessions(), 0);
}

#[tokio::test]
async fn test_parallelism_above_batch_count_admits_everything_in_order() {
    let executor = ScriptedExecutor::new()
        .with_default_script(Script::succeed().with_delay(Duration::from_millis(5)));
    let mut h = harness(executor);

    h.scheduler.run_all(batches(3), 10).await.unwrap();

    let lines = h.sink.lines();
    let expected: Vec<String> = (0..3)
        .flat_map(|i| {
            vec![
                format!("-------Starting Batch {i} --------"),
                format!("b{i}"),
                format!("-------End Batch {i} Listing --------"),
            ]
        })
        .collect();
    assert_eq!(lines[..9].to_vec(), expected);
    assert_eq!(h.scheduler.peak_running(), 3);
}

#[tokio::test]
async fn test_batch_narration_order() {
    let executor = ScriptedExecutor::new().with_script(
        "b0",
        Script::succeed()
            .with_delay(Duration::from_millis(5))
            .with_diagnostic(Diagnostic::info("one"))
            .with_diagnostic(Diagnostic::info("two")),
    );
    let mut h = harness(executor);

    h.scheduler.run_all(batches(1), 1).await.unwrap();

    let position = |line: &str| {
        h.sink
            .position(line)
            .unwrap_or_else(|| panic!("missing line {line:?}"))
    };
    let listing_end = position("-------End Batch 0 Listing --------");
    let first = position("Batch 0 InfoMessage: one");
    let second = position("Batch 0 InfoMessage: two");
    let done = position("Batch 0 Completed. Duration 0 sec");

    assert!(listing_end < first);
    assert!(first < second);
    assert!(second < done);

    let messages: Vec<&str> = h.scheduler.completed()[0]
        .diagnostics()
        .iter()
        .map(|d| d.message.as_str())
        .collect();
    assert_eq!(messages, vec!["one", "two"]);
}

#[tokio::test]
async fn test_panicking_execution_becomes_error_outcome() {
    let executor = ScriptedExecutor::new().with_script(
        "b0",
        Script::panic("kaboom").with_diagnostic(Diagnostic::info("before panic")),
    );
    let mut h = harness(executor);

    let err = h.scheduler.run_all(batches(1), 1).await.unwrap_err();

    match err {
        ParallelSqlError::Batch {
            sequence: 0,
            failure: BatchFailure::Fault { message },
        } => assert!(message.contains("kaboom")),
        other => panic!("unexpected error: {other:?}"),
    }
    let batch = &h.scheduler.completed()[0];
    assert_eq!(batch.outcome(), Some(BatchOutcome::Error));
    assert!(batch.ended_at().is_some());
    assert_eq!(batch.diagnostics().len(), 1);
    assert_eq!(h.stats.open_sessions(), 0);

    let lines = h.sink.lines();
    let failed = h
        .sink
        .position("Batch 0 Failed: execution task panicked: kaboom")
        .expect("failure line");
    assert_eq!(
        lines[failed + 1..failed + 4].to_vec(),
        vec![
            "-----------Failed batch Output--------------",
            "Error before panic Line 0 Severity INFO",
            "-----------Failed batch Output--------------",
        ]
    );
}

#[tokio::test]
async fn test_canceled_batch_outside_cascade_does_not_stop_run() {
    let executor = ScriptedExecutor::new().with_unreachable_target(
        "postgres://localhost/gone",
        ExecutionError::Canceled,
    );
    let mut h = harness(executor);
    let mut batches = batches(3);
    batches[0] = BatchRequest::new(0, "b0", Target::new("postgres://localhost/gone"));

    h.scheduler
        .run_all(batches, 1)
        .await
        .expect("a canceled batch is not a failure");

    assert_eq!(outcome_of(&h.scheduler, 0), Some(BatchOutcome::Canceled));
    assert_eq!(outcome_of(&h.scheduler, 1), Some(BatchOutcome::Completed));
    assert_eq!(outcome_of(&h.scheduler, 2), Some(BatchOutcome::Completed));
    assert!(!h.scheduler.context().is_cancelled());
    assert!(h.sink.position("Batch 0 Canceled. Duration 0 sec").is_some());
    assert_eq!(h.stats.executed(), vec!["b1".to_string(), "b2".to_string()]);
}

#[tokio::test]
async fn test_completion_order_is_first_finisher() {
    let executor = ScriptedExecutor::new()
        .with_script("b0", Script::succeed().with_delay(Duration::from_millis(120)))
        .with_script("b1", Script::succeed().with_delay(Duration::from_millis(5)));
    let mut h = harness(executor);

    h.scheduler.run_all(batches(2), 2).await.unwrap();

    let order: Vec<usize> = h.scheduler.completed().iter().map(|b| b.sequence()).collect();
    assert_eq!(order, vec![1, 0]);
}
