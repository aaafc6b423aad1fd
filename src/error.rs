//! # Diagnostics and error types
//!
//! The compiler never propagates errors across the public API. Every stage
//! accumulates [`Diagnostic`] values (with 1-based source positions) and
//! returns them alongside its best-effort result.
//!
//! [`ScoreError`] is the internal fallible-path error used inside the parser;
//! it is converted into a `Diagnostic` before any result leaves the crate.
//!
//! ## Severities
//! - `Error` - the output is incomplete or untrustworthy (bad octave, YAML
//!   decode failure, adjacent notes without separation)
//! - `Warning` - suspicious but compilable (undeclared stave, too many dots)
//! - `Info` - hints (unusual enharmonic spellings)

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Diagnostic severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// A located diagnostic message. Line and column are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: usize,
    pub column: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_column: Option<usize>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::new(Severity::Error, message, line, column)
    }

    pub fn warning(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::new(Severity::Warning, message, line, column)
    }

    pub fn info(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::new(Severity::Info, message, line, column)
    }

    fn new(severity: Severity, message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            severity,
            message: message.into(),
            line,
            column,
            end_line: None,
            end_column: None,
        }
    }

    /// Attach an end position to an existing diagnostic.
    pub fn with_end(mut self, end_line: usize, end_column: usize) -> Self {
        self.end_line = Some(end_line);
        self.end_column = Some(end_column);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}:{}: {}",
            self.severity, self.line, self.column, self.message
        )
    }
}

/// Internal error type for the parser's fallible paths.
///
/// These never cross the public API: the top-level parse converts any
/// `ScoreError` into an error-severity [`Diagnostic`] and keeps going.
#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("Parse error at line {line}, column {column}: {message}")]
    ParseError {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Invalid metadata: {0}")]
    MetadataError(String),
}

impl ScoreError {
    /// Convert into a user-facing diagnostic.
    pub fn into_diagnostic(self) -> Diagnostic {
        match self {
            ScoreError::ParseError {
                line,
                column,
                message,
            } => Diagnostic::error(message, line, column),
            ScoreError::MetadataError(message) => {
                Diagnostic::error(format!("Invalid metadata: {message}"), 1, 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::error("unexpected token", 5, 10);
        assert_eq!(d.to_string(), "error at 5:10: unexpected token");
    }

    #[test]
    fn test_score_error_into_diagnostic() {
        let e = ScoreError::ParseError {
            line: 2,
            column: 7,
            message: "Expected note".to_string(),
        };
        let d = e.into_diagnostic();
        assert_eq!(d.severity, Severity::Error);
        assert_eq!((d.line, d.column), (2, 7));
    }

    #[test]
    fn test_metadata_error_prefixes_message() {
        let d = ScoreError::MetadataError("bad tempo".to_string()).into_diagnostic();
        assert_eq!(d.message, "Invalid metadata: bad tempo");
    }
}
