//! Shared wire and storage types for the RLM runtime.
//!
//! Everything in this crate is plain data: the session/document/execution
//! records persisted in the metadata store, the per-turn artifacts produced by
//! the sandbox, and the error envelope surfaced at the driver boundary. No
//! I/O happens here.

mod error;
mod protocol;

pub use error::ErrorCode;
pub use error::ErrorEnvelope;
pub use protocol::AuditRecord;
pub use protocol::BudgetSnapshot;
pub use protocol::ConsumedBudget;
pub use protocol::DocumentRef;
pub use protocol::DocumentStatus;
pub use protocol::ExecutionDefaults;
pub use protocol::ExecutionMode;
pub use protocol::ExecutionRecord;
pub use protocol::ExecutionStatus;
pub use protocol::LeaseInfo;
pub use protocol::LlmRequest;
pub use protocol::OutputMode;
pub use protocol::ReadinessMode;
pub use protocol::SearchHit;
pub use protocol::SearchRequest;
pub use protocol::Session;
pub use protocol::SessionStatus;
pub use protocol::SpanLogEntry;
pub use protocol::SpanRef;
pub use protocol::StateEnvelope;
pub use protocol::StatePointer;
pub use protocol::StepError;
pub use protocol::StepResult;
pub use protocol::ToolRequests;
pub use protocol::ToolStatus;
pub use protocol::TurnRecord;
pub use protocol::TurnTimings;
pub use protocol::BUDGETS_KEY;
pub use protocol::RESERVED_STATE_KEYS;
pub use protocol::TOOL_RESULTS_KEY;
pub use protocol::TOOL_SCHEMA_KEY;
pub use protocol::TOOL_STATUS_KEY;
pub use protocol::TRACE_KEY;
