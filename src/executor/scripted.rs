//! In-memory executor with scripted per-batch behaviour.
//!
//! Each batch text maps to a [`Script`]; unknown texts use the default
//! script. Session counters make the concurrency of a run observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Diagnostic, DiagnosticListener, ExecutionError, Session, StatementExecutor};
use crate::catalog::Target;

/// How a scripted batch ends
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedBehavior {
    /// Finish normally
    Succeed,
    /// Fail with backend error records
    BackendError(Vec<Diagnostic>),
    /// Fail with an executor fault
    Fault(String),
    /// Panic inside the execution task
    Panic(String),
}

/// Scripted behaviour of one batch text
#[derive(Debug, Clone)]
pub struct Script {
    behavior: ScriptedBehavior,
    delay: Duration,
    diagnostics: Vec<Diagnostic>,
    honors_cancel: bool,
}

impl Script {
    fn with_behavior(behavior: ScriptedBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            diagnostics: Vec::new(),
            honors_cancel: true,
        }
    }

    /// Succeed after the delay
    pub fn succeed() -> Self {
        Self::with_behavior(ScriptedBehavior::Succeed)
    }

    /// Fail with backend error records after the delay
    pub fn backend_error(records: Vec<Diagnostic>) -> Self {
        Self::with_behavior(ScriptedBehavior::BackendError(records))
    }

    /// Fail with a fault after the delay
    pub fn fault(message: impl Into<String>) -> Self {
        Self::with_behavior(ScriptedBehavior::Fault(message.into()))
    }

    /// Panic after the delay
    pub fn panic(message: impl Into<String>) -> Self {
        Self::with_behavior(ScriptedBehavior::Panic(message.into()))
    }

    /// Time the statement takes
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Diagnostic emitted as soon as execution starts
    pub fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }

    /// Keep running to the scripted end even after cancellation
    pub fn ignoring_cancel(mut self) -> Self {
        self.honors_cancel = false;
        self
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::succeed()
    }
}

/// Session counters shared by an executor and its sessions
#[derive(Debug, Default)]
pub struct SessionStats {
    open: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl SessionStats {
    /// Sessions currently open
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at once
    pub fn peak_open_sessions(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Sessions successfully opened
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sessions released, by close or drop
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Batch texts issued, in issue order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    fn on_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn on_release(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Executor answering from scripts instead of a database
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Arc<HashMap<String, Script>>,
    default_script: Script,
    unreachable: HashMap<Target, ExecutionError>,
    stats: Arc<SessionStats>,
}

impl ScriptedExecutor {
    /// Executor where every batch succeeds immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for one batch text
    pub fn with_script(mut self, text: impl Into<String>, script: Script) -> Self {
        Arc::make_mut(&mut self.scripts).insert(text.into(), script);
        self
    }

    /// Script for texts without their own
    pub fn with_default_script(mut self, script: Script) -> Self {
        self.default_script = script;
        self
    }

    /// Fail every session opened against `target`
    pub fn with_unreachable_target(
        mut self,
        target: impl Into<Target>,
        error: ExecutionError,
    ) -> Self {
        self.unreachable.insert(target.into(), error);
        self
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl StatementExecutor for ScriptedExecutor {
    type Session = ScriptedSession;

    async fn open(&self, target: &Target) -> Result<ScriptedSession, ExecutionError> {
        if let Some(error) = self.unreachable.get(target) {
            return Err(error.clone());
        }
        self.stats.on_open();
        Ok(ScriptedSession {
            scripts: Arc::clone(&self.scripts),
            default_script: self.default_script.clone(),
            listener: None,
            stats: Some(Arc::clone(&self.stats)),
        })
    }
}

/// Session of a [`ScriptedExecutor`]
#[derive(Debug)]
pub struct ScriptedSession {
    scripts: Arc<HashMap<String, Script>>,
    default_script: Script,
    listener: Option<DiagnosticListener>,
    // Cleared on release so close followed by drop counts once.
    stats: Option<Arc<SessionStats>>,
}

impl ScriptedSession {
    fn script_for(&self, text: &str) -> &Script {
        self.scripts.get(text).unwrap_or(&self.default_script)
    }

    fn release(&mut self) {
        if let Some(stats) = self.stats.take() {
            stats.on_release();
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    fn set_listener(&mut self, listener: DiagnosticListener) {
        self.listener = Some(listener);
    }

    async fn execute(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let script = self.script_for(text).clone();
        if let Some(stats) = &self.stats {
            stats.executed.lock().push(text.to_string());
        }

        if script.honors_cancel && cancel.is_cancelled() {
            return Err(ExecutionError::Canceled);
        }
        if let Some(listener) = &self.listener {
            for diagnostic in &script.diagnostics {
                listener.notify(diagnostic.clone());
            }
        }

        if script.honors_cancel {
            tokio::select! {
                _ = tokio::time::sleep(script.delay) => {}
                _ = cancel.cancelled() => return Err(ExecutionError::Canceled),
            }
        } else {
            tokio::time::sleep(script.delay).await;
        }

        match script.behavior {
            ScriptedBehavior::Succeed => Ok(()),
            ScriptedBehavior::BackendError(records) => Err(ExecutionError::Backend(records)),
            ScriptedBehavior::Fault(message) => Err(ExecutionError::Fault(message)),
            ScriptedBehavior::Panic(message) => panic!("{}", message),
        }
    }

    async fn close(&mut self) -> Result<(), ExecutionError> {
        self.release();
        Ok(())
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.release();
    }
}
