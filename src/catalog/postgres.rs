//! Catalog and default target read from PostgreSQL

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Row};
use tracing::{debug, info, instrument};

use super::{CatalogRow, CatalogSource, Target, TargetResolver};
use crate::config::PostgresConfig;
use crate::{ParallelSqlError, Result};

/// Catalog and default-target source backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgCatalog {
    config: PostgresConfig,
}

impl PgCatalog {
    /// Create a catalog reading from `config.database_url`
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<PgConnection> {
        let target = Target::new(self.config.database_url.clone());
        let connecting = PgConnection::connect(target.as_str());
        match tokio::time::timeout(self.config.connect_timeout, connecting).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(ParallelSqlError::Internal(format!(
                "timed out after {:?} connecting to {}",
                self.config.connect_timeout, target
            ))),
        }
    }
}

fn decode_row(index: usize, row: &PgRow) -> CatalogRow {
    // A first column that is not text decodes as a null batch and is
    // rejected when the catalog is built.
    let text = row.try_get::<Option<String>, _>(0).ok().flatten();
    let target = if row.columns().len() > 1 {
        row.try_get::<Option<String>, _>(1).ok().flatten().map(Target::new)
    } else {
        None
    };
    debug!(row = index, has_override = target.is_some(), "Decoded catalog row");
    CatalogRow { text, target }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    #[instrument(skip(self, query))]
    async fn fetch(&self, query: &str) -> Result<Vec<CatalogRow>> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(query).fetch_all(&mut conn).await?;
        let catalog: Vec<CatalogRow> = rows
            .iter()
            .enumerate()
            .map(|(index, row)| decode_row(index, row))
            .collect();
        conn.close().await?;

        info!(rows = catalog.len(), "Fetched batch list");
        Ok(catalog)
    }
}

#[async_trait]
impl TargetResolver for PgCatalog {
    #[instrument(skip(self))]
    async fn resolve_default(&self) -> Result<Target> {
        let mut conn = self.connect().await?;
        let database = sqlx::query_scalar::<_, String>("SELECT current_database()")
            .fetch_one(&mut conn)
            .await
            .map_err(|e| ParallelSqlError::TargetResolution(e.to_string()))?;
        conn.close().await?;

        let target = Target::new(self.config.database_url.clone()).with_database(&database);
        info!(target = %target, "Resolved default target");
        Ok(target)
    }
}
