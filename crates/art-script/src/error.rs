//! Diagnostics and runtime errors.

use std::fmt;

use thiserror::Error;

use crate::token::Position;

// ---------------------------------------------------------------------------
// Diagnostics (lexing + parsing)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A lexical or parse diagnostic with source-line context.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
    /// The full source line the diagnostic points into.
    pub context: String,
}

impl Diagnostic {
    pub fn error(pos: Position, message: impl Into<String>, context: impl Into<String>) -> Self {
        Diagnostic {
            line: pos.line,
            column: pos.column,
            severity: Severity::Error,
            message: message.into(),
            context: context.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}:{}: {}: {}",
            self.line, self.column, self.severity, self.message
        )?;
        writeln!(f, "  | {}", self.context)?;
        // Caret under the offending column (1-based).
        let pad = " ".repeat(self.column.saturating_sub(1) as usize);
        write!(f, "  | {}^", pad)
    }
}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

/// A script runtime error; catchable by TRY/CATCH, which binds the message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub pos: Option<Position>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            pos: None,
        }
    }

    pub fn at(pos: Position, message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            pos: Some(pos),
        }
    }
}
