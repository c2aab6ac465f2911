//! PostgreSQL statement executor.
//!
//! One connection per session. Cancellation goes through the server: the
//! session asks a side connection to `pg_cancel_backend` its backend and then
//! waits for the statement to end on its own, so a statement that is already
//! committing still reports its real result.
//!
//! sqlx does not hand NOTICE messages to callers, so the only informational
//! diagnostic a session reports is the affected-row count of a successful
//! batch. Error records carry the server's severity, SQLSTATE and the line of
//! the batch text the error points at.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgDatabaseError, PgErrorPosition, PgSeverity};
use sqlx::{Connection, PgConnection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{Diagnostic, DiagnosticListener, ExecutionError, Session, Severity, StatementExecutor};
use crate::catalog::Target;
use crate::config::PostgresConfig;

/// SQLSTATE reported for statements stopped by a cancel request
const QUERY_CANCELED: &str = "57014";

/// Executor opening one `PgConnection` per batch
#[derive(Debug, Clone)]
pub struct PgExecutor {
    connect_timeout: Duration,
}

impl PgExecutor {
    /// Create an executor using the connect timeout from `config`
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
        }
    }
}

async fn connect(target: &Target, timeout: Duration) -> anyhow::Result<PgConnection> {
    tokio::time::timeout(timeout, PgConnection::connect(target.as_str()))
        .await
        .with_context(|| format!("timed out after {timeout:?} connecting to {target}"))?
        .with_context(|| format!("failed to connect to {target}"))
}

#[async_trait]
impl StatementExecutor for PgExecutor {
    type Session = PgSession;

    #[instrument(skip_all, fields(db = %target))]
    async fn open(&self, target: &Target) -> Result<PgSession, ExecutionError> {
        let mut conn = connect(target, self.connect_timeout)
            .await
            .map_err(|e| ExecutionError::Fault(format!("{e:#}")))?;

        let backend_pid = sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await
            .map_err(|e| ExecutionError::Fault(format!("failed to read backend pid: {e}")))?;
        debug!(backend_pid, "Session opened");

        Ok(PgSession {
            conn: Some(conn),
            backend_pid,
            target: target.clone(),
            connect_timeout: self.connect_timeout,
            listener: None,
        })
    }
}

/// One Postgres connection owned by a single batch
pub struct PgSession {
    conn: Option<PgConnection>,
    backend_pid: i32,
    target: Target,
    connect_timeout: Duration,
    listener: Option<DiagnosticListener>,
}

impl PgSession {
    /// Server process id serving this session
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("backend_pid", &self.backend_pid)
            .field("target", &self.target)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

async fn request_cancel(target: &Target, backend_pid: i32, timeout: Duration) {
    let result = async {
        let mut side = connect(target, timeout).await?;
        let signalled = sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
            .bind(backend_pid)
            .fetch_one(&mut side)
            .await
            .context("pg_cancel_backend failed")?;
        side.close().await.context("failed to close cancel connection")?;
        anyhow::Ok(signalled)
    }
    .await;

    match result {
        Ok(signalled) => debug!(backend_pid, signalled, "Cancel requested"),
        Err(e) => {
            let error = format!("{e:#}");
            warn!(backend_pid, error = %error, "Could not request cancel");
        }
    }
}

#[async_trait]
impl Session for PgSession {
    fn set_listener(&mut self, listener: DiagnosticListener) {
        self.listener = Some(listener);
    }

    async fn execute(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Canceled);
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ExecutionError::Fault("session already closed".to_string()))?;

        let statement = sqlx::Executor::execute(conn, sqlx::raw_sql(text));
        tokio::pin!(statement);

        let result = tokio::select! {
            result = &mut statement => result,
            _ = cancel.cancelled() => {
                request_cancel(&self.target, self.backend_pid, self.connect_timeout).await;
                statement.await
            }
        };

        match result {
            Ok(done) => {
                if let Some(listener) = &self.listener {
                    let summary = format!("({} rows affected)", done.rows_affected());
                    listener.notify(Diagnostic::new(Severity::Notice, summary));
                }
                Ok(())
            }
            Err(e) => Err(map_error(e, text)),
        }
    }

    async fn close(&mut self) -> Result<(), ExecutionError> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .await
                .map_err(|e| ExecutionError::Fault(format!("failed to close connection: {e}"))),
            None => Ok(()),
        }
    }
}

fn map_error(err: sqlx::Error, text: &str) -> ExecutionError {
    match &err {
        sqlx::Error::Database(db) => match db.try_downcast_ref::<PgDatabaseError>() {
            Some(pg) if pg.code() == QUERY_CANCELED => ExecutionError::Canceled,
            Some(pg) => ExecutionError::Backend(vec![diagnostic_from_pg(pg, text)]),
            None => {
                let mut diagnostic = Diagnostic::error(db.message());
                if let Some(code) = db.code() {
                    diagnostic = diagnostic.with_code(code);
                }
                ExecutionError::Backend(vec![diagnostic])
            }
        },
        _ => ExecutionError::Fault(err.to_string()),
    }
}

fn diagnostic_from_pg(pg: &PgDatabaseError, text: &str) -> Diagnostic {
    let mut diagnostic =
        Diagnostic::new(map_severity(pg.severity()), pg.message()).with_code(pg.code());
    if let Some(PgErrorPosition::Original(position)) = pg.position() {
        diagnostic = diagnostic.with_line(line_of(text, position));
    }
    diagnostic
}

fn map_severity(severity: PgSeverity) -> Severity {
    match severity {
        PgSeverity::Panic | PgSeverity::Fatal => Severity::Fatal,
        PgSeverity::Error => Severity::Error,
        PgSeverity::Warning => Severity::Warning,
        PgSeverity::Notice => Severity::Notice,
        PgSeverity::Info | PgSeverity::Log => Severity::Info,
        PgSeverity::Debug => Severity::Debug,
    }
}

/// One-based line of a one-based character position
fn line_of(text: &str, position: usize) -> u32 {
    let newlines = text
        .chars()
        .take(position.saturating_sub(1))
        .filter(|c| *c == '\n')
        .count();
    newlines as u32 + 1
}
