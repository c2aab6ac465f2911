use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::catalog::Target;
use crate::executor::{summarize, Diagnostic};

/// Terminal outcome of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchOutcome {
    /// Ran to completion
    Completed,
    /// Observed the run's cancellation signal
    Canceled,
    /// Backend error or execution fault
    Error,
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchOutcome::Completed => "Completed",
            BatchOutcome::Canceled => "Canceled",
            BatchOutcome::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Failure captured on a batch that ended in [`BatchOutcome::Error`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchFailure {
    /// Backend reported error records
    #[error("{}", summarize(.records))]
    Backend {
        /// Records carried by the backend error
        records: Vec<Diagnostic>,
    },

    /// Unexpected fault in the executor layer or the execution task
    #[error("{message}")]
    Fault {
        /// Fault description
        message: String,
    },
}

/// One independently executable unit of work
#[derive(Debug, Clone)]
pub struct BatchRequest {
    sequence: usize,
    text: String,
    target: Target,
    diagnostics: Vec<Diagnostic>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    outcome: Option<BatchOutcome>,
    failure: Option<BatchFailure>,
}

impl BatchRequest {
    /// Create a pending batch
    pub fn new(sequence: usize, text: impl Into<String>, target: Target) -> Self {
        Self {
            sequence,
            text: text.into(),
            target,
            diagnostics: Vec::new(),
            started_at: None,
            ended_at: None,
            outcome: None,
            failure: None,
        }
    }

    /// Zero-based position in the catalog
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Batch text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Connection target
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Diagnostics in arrival order
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// When the batch text was issued
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When execution ended
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Terminal outcome; `None` while pending or running
    pub fn outcome(&self) -> Option<BatchOutcome> {
        self.outcome
    }

    /// Captured failure, set only with [`BatchOutcome::Error`]
    pub fn failure(&self) -> Option<&BatchFailure> {
        self.failure.as_ref()
    }

    /// No terminal outcome yet
    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    /// Wall-clock time between start and end
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Whole seconds of [`duration`](Self::duration), zero when never started
    pub fn duration_secs(&self) -> i64 {
        self.duration().map(|d| d.num_seconds()).unwrap_or(0)
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_ended(&mut self) {
        let now = Utc::now();
        // Wall clock can step backwards; keep start <= end.
        self.ended_at = Some(match self.started_at {
            Some(start) if start > now => start,
            _ => now,
        });
    }

    pub(crate) fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Set the terminal outcome. Returns false if one was already set.
    pub(crate) fn set_outcome(&mut self, outcome: BatchOutcome) -> bool {
        if let Some(existing) = self.outcome {
            warn!(
                batch = self.sequence,
                existing = %existing,
                rejected = %outcome,
                "Outcome already set"
            );
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    pub(crate) fn fail(&mut self, failure: BatchFailure) -> bool {
        if !self.set_outcome(BatchOutcome::Error) {
            return false;
        }
        self.failure = Some(failure);
        true
    }
}

impl fmt::Display for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch {}", self.sequence)
    }
}
