use thiserror::Error;

/// Failure while tokenizing or parsing a step source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at line {line}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Classification of a runtime failure inside the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    Type,
    Name,
    Value,
    Index,
    Key,
    Attribute,
    ZeroDivision,
    /// The per-step instruction budget was exhausted.
    InstructionLimit,
    /// Too many tool requests were queued in one step.
    ToolRequestLimit,
    /// Error surfaced by the corpus host (I/O, span budget, integrity).
    Host(HostErrorKind),
}

impl EvalErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            EvalErrorKind::Type => "TypeError",
            EvalErrorKind::Name => "NameError",
            EvalErrorKind::Value => "ValueError",
            EvalErrorKind::Index => "IndexError",
            EvalErrorKind::Key => "KeyError",
            EvalErrorKind::Attribute => "AttributeError",
            EvalErrorKind::ZeroDivision => "ZeroDivisionError",
            EvalErrorKind::InstructionLimit => "InstructionLimit",
            EvalErrorKind::ToolRequestLimit => "ToolRequestLimit",
            EvalErrorKind::Host(kind) => kind.label(),
        }
    }
}

/// Uncaught error from evaluating a step. Captured into the step result; the
/// orchestrator surfaces it to the model on the next turn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} at line {line}: {message}", kind.label())]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub line: u32,
    pub message: String,
}

impl EvalError {
    pub(crate) fn new(kind: EvalErrorKind, line: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// The per-step or execution-wide span budget was exhausted.
    SpanBudget,
    /// Range read against the object store failed.
    Read,
    /// Invalid pattern handed to `doc.regex`.
    BadPattern,
    /// Canonical text or sidecar failed an integrity check.
    Integrity,
}

impl HostErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            HostErrorKind::SpanBudget => "SpanBudgetExceeded",
            HostErrorKind::Read => "ReadError",
            HostErrorKind::BadPattern => "BadPattern",
            HostErrorKind::Integrity => "IntegrityError",
        }
    }
}

/// Error returned by [`crate::CorpusHost`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", kind.label())]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
