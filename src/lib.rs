//! # parallel-sql
//!
//! Runs an ordered list of independent SQL batches against a shared backend,
//! at most N at a time, with an all-or-nothing failure policy: the first batch
//! that ends in error cancels every batch still running, the run waits for all
//! of them to drain, and the triggering error is returned to the caller.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parallel_sql::catalog::PgCatalog;
//! use parallel_sql::config::{PostgresConfig, RunConfig};
//! use parallel_sql::executor::PgExecutor;
//! use parallel_sql::narration::TracingSink;
//! use parallel_sql::run::ParallelExecution;
//!
//! # async fn example() -> parallel_sql::Result<()> {
//! let pg = PostgresConfig::default();
//! let executor = Arc::new(PgExecutor::new(pg.clone()));
//! let execution = ParallelExecution::new(PgCatalog::new(pg), executor)
//!     .with_sink(Arc::new(TracingSink))
//!     .with_config(RunConfig::default().with_degree_of_parallelism(4));
//!
//! let report = execution
//!     .run("SELECT sql_text FROM maintenance.batches ORDER BY id")
//!     .await?;
//! println!("{}", report.summary);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: batch model, per-batch runner, scheduler and failure cascade
//! - [`executor`]: statement executor seam plus Postgres and scripted backends
//! - [`catalog`]: batch discovery and default target resolution
//! - [`narration`]: ordered progress delivery to an external observer
//! - [`run`]: the public entry point
//! - [`config`]: run and backend configuration
//! - [`telemetry`]: tracing subscriber setup

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

use crate::batch::BatchFailure;

/// Result type for parallel-sql operations
pub type Result<T> = std::result::Result<T, ParallelSqlError>;

/// Main error type for parallel-sql operations
#[derive(Error, Debug)]
pub enum ParallelSqlError {
    /// The batch list query returned a row that cannot become a batch.
    /// Raised before any batch starts.
    #[error("Catalog error at row {row}: {reason}")]
    Catalog {
        /// Zero-based row index in the catalog result
        row: usize,
        /// What was wrong with the row
        reason: String,
    },

    /// First batch to end in error; re-raised after the cascade drained
    #[error("Batch {sequence} failed: {failure}")]
    Batch {
        /// Sequence number of the failing batch
        sequence: usize,
        /// Failure captured on the batch
        failure: BatchFailure,
    },

    /// Default target could not be derived
    #[error("Target resolution error: {0}")]
    TargetResolution(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error outside of batch execution (catalog, setup)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParallelSqlError {
    /// Sequence number of the failing batch, if this error came from one
    pub fn batch_sequence(&self) -> Option<usize> {
        match self {
            ParallelSqlError::Batch { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}

/// Batch model, runner, scheduler and failure cascade
pub mod batch;

/// Statement executor seam and backends
pub mod executor;

/// Batch discovery and target resolution
pub mod catalog;

/// Ordered progress narration
pub mod narration;

/// Public entry point
pub mod run;

/// Configuration
pub mod config;

/// Tracing setup
pub mod telemetry;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchFailure;

    #[test]
    fn test_batch_error_exposes_sequence() {
        let err = ParallelSqlError::Batch {
            sequence: 3,
            failure: BatchFailure::Fault {
                message: "boom".to_string(),
            },
        };

        assert_eq!(err.batch_sequence(), Some(3));
        assert_eq!(err.to_string(), "Batch 3 failed: boom");
    }

    #[test]
    fn test_catalog_error_display() {
        let err = ParallelSqlError::Catalog {
            row: 2,
            reason: "batch text is null".to_string(),
        };

        assert!(err.batch_sequence().is_none());
        assert_eq!(err.to_string(), "Catalog error at row 2: batch text is null");
    }
}
