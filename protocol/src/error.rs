use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Error codes surfaced at service boundaries.
///
/// The serialized form is the wire contract; drivers switch on these strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[error("SESSION_NOT_FOUND")]
    SessionNotFound,
    #[error("SESSION_NOT_READY")]
    SessionNotReady,
    #[error("EXECUTION_NOT_FOUND")]
    ExecutionNotFound,
    #[error("VALIDATION_ERROR")]
    ValidationError,
    #[error("BUDGET_EXCEEDED")]
    BudgetExceeded,
    #[error("MAX_TURNS_EXCEEDED")]
    MaxTurnsExceeded,
    #[error("STEP_TIMEOUT")]
    StepTimeout,
    #[error("SANDBOX_AST_REJECTED")]
    SandboxAstRejected,
    #[error("SANDBOX_LINE_LIMIT")]
    SandboxLineLimit,
    /// Uncaught runtime error inside a step (NameError, TypeError, ...).
    #[error("SANDBOX_RUNTIME_ERROR")]
    SandboxRuntimeError,
    #[error("STATE_INVALID_TYPE")]
    StateInvalidType,
    #[error("STATE_TOO_LARGE")]
    StateTooLarge,
    #[error("CHECKSUM_MISMATCH")]
    ChecksumMismatch,
    #[error("S3_READ_ERROR")]
    S3ReadError,
    #[error("PARSER_ERROR")]
    ParserError,
    #[error("LLM_PROVIDER_ERROR")]
    LlmProviderError,
    #[error("INTERNAL_ERROR")]
    InternalError,
}

/// Structured error payload returned across the driver boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: None,
        }
    }
}
