//! Batch discovery and default target resolution

pub mod postgres;
mod target;

pub use postgres::PgCatalog;
pub use target::Target;

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::batch::BatchRequest;
use crate::{ParallelSqlError, Result};

/// One row of the batch list query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    /// Batch text; required and non-empty
    pub text: Option<String>,
    /// Optional per-batch target override
    pub target: Option<Target>,
}

impl CatalogRow {
    /// Row with text and no override
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            target: None,
        }
    }

    /// Row whose text column was null
    pub fn null() -> Self {
        Self { text: None, target: None }
    }

    /// Attach a target override
    pub fn with_target(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Produces the ordered batch list
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Run the batch list query
    async fn fetch(&self, query: &str) -> Result<Vec<CatalogRow>>;
}

/// Derives the default target with a single setup call
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Resolve the target used by batches without an override
    async fn resolve_default(&self) -> Result<Target>;
}

/// Turn catalog rows into batches, numbered from zero in row order.
///
/// Fails on the first row with null or empty text; no batch is built.
pub fn build_catalog(rows: Vec<CatalogRow>, default_target: &Target) -> Result<Vec<BatchRequest>> {
    let mut batches = Vec::with_capacity(rows.len());
    for (row, entry) in rows.into_iter().enumerate() {
        let text = match entry.text {
            Some(text) if !text.trim().is_empty() => text,
            Some(_) => {
                return Err(ParallelSqlError::Catalog {
                    row,
                    reason: "batch text is empty".to_string(),
                })
            }
            None => {
                return Err(ParallelSqlError::Catalog {
                    row,
                    reason: "batch text is null or first column was not a string".to_string(),
                })
            }
        };
        let target = entry.target.unwrap_or_else(|| default_target.clone());
        batches.push(BatchRequest::new(row, text, target));
    }
    debug!(batches = batches.len(), "Catalog built");
    Ok(batches)
}

/// Fixed rows and default target, for embedding and tests
#[derive(Debug)]
pub struct StaticCatalog {
    rows: Vec<CatalogRow>,
    default_target: Target,
    resolve_calls: AtomicUsize,
}

impl StaticCatalog {
    /// Create a catalog serving `rows`
    pub fn new(rows: Vec<CatalogRow>, default_target: impl Into<Target>) -> Self {
        Self {
            rows,
            default_target: default_target.into(),
            resolve_calls: AtomicUsize::new(0),
        }
    }

    /// Catalog of plain batch texts
    pub fn from_texts<I, S>(texts: I, default_target: impl Into<Target>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(CatalogRow::new).collect(), default_target)
    }

    /// How many times the default target was resolved
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn fetch(&self, _query: &str) -> Result<Vec<CatalogRow>> {
        Ok(self.rows.clone())
    }
}

#[async_trait]
impl TargetResolver for StaticCatalog {
    async fn resolve_default(&self) -> Result<Target> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.default_target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_catalog_numbers_rows_in_order() {
        let default = Target::new("postgres://localhost/main");
        let rows = vec![
            CatalogRow::new("SELECT 1"),
            CatalogRow::new("SELECT 2").with_target("postgres://localhost/other"),
            CatalogRow::new("SELECT 3"),
        ];

        let batches = build_catalog(rows, &default).unwrap();

        let seen: Vec<(usize, &str, &str)> = batches
            .iter()
            .map(|b| (b.sequence(), b.text(), b.target().as_str()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (0, "SELECT 1", "postgres://localhost/main"),
                (1, "SELECT 2", "postgres://localhost/other"),
                (2, "SELECT 3", "postgres://localhost/main"),
            ]
        );
        assert!(batches.iter().all(|b| b.is_pending()));
    }

    #[test]
    fn test_build_catalog_rejects_null_text() {
        let rows = vec![CatalogRow::new("SELECT 1"), CatalogRow::null()];
        let err = build_catalog(rows, &Target::new("postgres://localhost/main")).unwrap_err();
        assert!(matches!(err, ParallelSqlError::Catalog { row: 1, .. }));
    }

    #[test]
    fn test_build_catalog_rejects_blank_text() {
        let rows = vec![CatalogRow::new("   ")];
        let err = build_catalog(rows, &Target::new("postgres://localhost/main")).unwrap_err();
        assert!(matches!(err, ParallelSqlError::Catalog { row: 0, .. }));
    }

    #[test]
    fn test_static_catalog_counts_resolution() {
        let catalog = StaticCatalog::from_texts(["SELECT 1"], "postgres://localhost/main");

        let rows = tokio_test::block_on(catalog.fetch("ignored")).unwrap();
        assert_eq!(rows, vec![CatalogRow::new("SELECT 1")]);
        assert_eq!(catalog.resolve_calls(), 0);

        let target = tokio_test::block_on(catalog.resolve_default()).unwrap();
        assert_eq!(target.as_str(), "postgres://localhost/main");
        assert_eq!(catalog.resolve_calls(), 1);
    }
}
