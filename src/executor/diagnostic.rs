use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a diagnostic record, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Debug output
    Debug,
    /// Informational message
    Info,
    /// Notice (e.g. `RAISE NOTICE`, row counts)
    Notice,
    /// Warning that does not stop the batch
    Warning,
    /// Statement error
    Error,
    /// Session-terminating error
    Fatal,
}

impl Severity {
    /// Records at or above this severity are hard errors
    pub const ERROR_THRESHOLD: Severity = Severity::Error;

    /// Whether this severity meets the error threshold
    pub fn is_error(self) -> bool {
        self >= Self::ERROR_THRESHOLD
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// A structured message produced by the backend while running a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Message text
    pub message: String,
    /// Severity class
    pub severity: Severity,
    /// Backend-specific code (SQLSTATE for Postgres)
    pub code: Option<String>,
    /// One-based line within the batch text, when known
    pub line: Option<u32>,
}

impl Diagnostic {
    /// Create a diagnostic with the given severity
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
            code: None,
            line: None,
        }
    }

    /// Informational diagnostic
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    /// Error diagnostic
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    /// Attach a backend code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a source line
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Whether this record is a hard error
    pub fn is_error(&self) -> bool {
        self.severity.is_error()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error {} Line {} Severity {}",
            self.message,
            self.line.unwrap_or(0),
            self.severity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_threshold() {
        assert!(!Severity::Notice.is_error());
        assert!(!Severity::Warning.is_error());
        assert!(Severity::Error.is_error());
        assert!(Severity::Fatal.is_error());
    }

    #[test]
    fn test_diagnostic_display_matches_failed_output_format() {
        let diag = Diagnostic::error("division by zero").with_line(3).with_code("22012");
        assert_eq!(diag.to_string(), "Error division by zero Line 3 Severity ERROR");
    }
}
