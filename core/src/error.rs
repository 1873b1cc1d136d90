use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use rlm_protocol::ErrorCode;
use rlm_protocol::ErrorEnvelope;
use rlm_protocol::ExecutionStatus;

use crate::providers::ProviderErr;
use crate::storage::StorageErr;

pub type Result<T> = std::result::Result<T, RlmErr>;

#[derive(Error, Debug)]
pub enum RlmErr {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("session not ready: {0}")]
    SessionNotReady(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("validation error: {0}")]
    Validation(String),

    /// State contained a value outside the JSON model.
    #[error("invalid state type: {0}")]
    StateInvalidType(String),

    #[error("state too large: {size} bytes exceeds cap of {max}")]
    StateTooLarge { size: usize, max: usize },

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    /// Another orchestrator instance holds (or raced us to) the lease.
    #[error("lease conflict for execution {0}")]
    LeaseConflict(Uuid),

    /// An execution total was exhausted; carries the terminal status it
    /// produced.
    #[error("budget exhausted: {0:?}")]
    BudgetExhausted(ExecutionStatus),

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageErr),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderErr),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RlmErr {
    /// The boundary error code drivers switch on.
    pub fn code(&self) -> ErrorCode {
        match self {
            RlmErr::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RlmErr::SessionNotReady(_) => ErrorCode::SessionNotReady,
            RlmErr::ExecutionNotFound(_) => ErrorCode::ExecutionNotFound,
            RlmErr::Validation(_) => ErrorCode::ValidationError,
            RlmErr::StateInvalidType(_) => ErrorCode::StateInvalidType,
            RlmErr::StateTooLarge { .. } => ErrorCode::StateTooLarge,
            RlmErr::ChecksumMismatch(_) => ErrorCode::ChecksumMismatch,
            RlmErr::BudgetExhausted(ExecutionStatus::MaxTurnsExceeded) => {
                ErrorCode::MaxTurnsExceeded
            }
            RlmErr::BudgetExhausted(_) => ErrorCode::BudgetExceeded,
            RlmErr::Storage(StorageErr::NotFound(_)) => ErrorCode::S3ReadError,
            RlmErr::Storage(_) => ErrorCode::S3ReadError,
            RlmErr::Provider(_) => ErrorCode::LlmProviderError,
            RlmErr::Cancelled
            | RlmErr::LeaseConflict(_)
            | RlmErr::Json(_)
            | RlmErr::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.code(), self.to_string())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        RlmErr::Internal(message.into())
    }
}

/// Truncate an error payload before it is surfaced into model-visible state.
pub(crate) fn truncate_error_text(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        let mut out: String = message.chars().take(max_chars).collect();
        out.push_str("…");
        out
    }
}

/// Render a value for the error `details` field, bounded in size.
pub(crate) fn bounded_details(value: Value) -> Value {
    match serde_json::to_string(&value) {
        Ok(s) if s.len() <= 4_096 => value,
        Ok(s) => Value::String(truncate_error_text(&s, 4_096)),
        Err(_) => Value::Null,
    }
}
