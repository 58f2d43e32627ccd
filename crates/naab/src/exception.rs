use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::value::Value;

/// Exception kinds carried in the `type` field of a `NaabError` value.
///
/// The string form matches the variant name exactly (`TypeError` ->
/// "TypeError") via the strum derives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ExcKind {
    /// Fed by the parser: lexing or syntax failures.
    ParseError,
    /// Declared-type mismatch or invalid operator operands.
    TypeError,
    /// Unbound identifier.
    NameError,
    /// List subscript out of bounds; range with non-int endpoints.
    RangeError,
    /// Dict missing key.
    KeyError,
    /// Wrong argument count.
    ArityError,
    /// Integer or float division by zero.
    DivisionByZero,
    /// Resolution, parse, or cycle failure during import.
    ModuleError,
    /// Any foreign-runtime failure.
    PolyglotError,
    /// Foreign execution exceeded its budget.
    TimeoutError,
    /// `throw` of a value that is not already a `NaabError`.
    UserError,
    /// File and stdio failures.
    IOError,
}

/// A runtime error before it is materialized as a `NaabError` value.
///
/// Leaf components (cache, polyglot adapters, marshalling) report failures
/// with this; the evaluator turns it into a heap-allocated error dict with
/// the current stack attached.
#[derive(Debug, Clone)]
pub struct SimpleError {
    pub kind: ExcKind,
    pub message: String,
}

impl SimpleError {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<std::io::Error> for SimpleError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ExcKind::IOError, err.to_string())
    }
}

/// Result alias used throughout the evaluator.
pub type RunResult<T> = Result<T, RunError>;

/// The evaluator's unwind signal.
///
/// `Exc` carries a `NaabError` dict value and unwinds to the nearest
/// `try`; `Return` unwinds to the enclosing function frame; `Break` and
/// `Continue` unwind no further than the enclosing loop. Each is consumed
/// at exactly one frame kind, and `finally` blocks run on every path.
#[derive(Debug)]
pub enum RunError {
    Exc(Value),
    Return(Value),
    Break,
    Continue,
}

/// Source location attached to a rendered exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLoc {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// The public, heap-independent form of an uncaught error.
///
/// Extracted from the `NaabError` dict when an error escapes the script's
/// top level, and consumed by the reporter and the CLI.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: String,
    pub message: String,
    pub stack: Vec<String>,
    pub location: Option<CodeLoc>,
    pub help: Option<String>,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: Vec::new(),
            location: None,
            help: None,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " ({loc})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn kind_round_trips_through_strings() {
        assert_eq!(ExcKind::TypeError.to_string(), "TypeError");
        assert_eq!(
            ExcKind::from_str("DivisionByZero").unwrap(),
            ExcKind::DivisionByZero
        );
        assert!(ExcKind::from_str("NopeError").is_err());
    }
}
