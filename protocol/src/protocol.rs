//! Core data model for sessions, executions and turns.
//!
//! These types are what the orchestrator persists to the metadata store and
//! what drivers see through the command interface. Field layouts are part of
//! the storage format, so changes here must stay backward compatible.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// State keys owned by the orchestrator. Sandbox code can read them but any
/// mutation is reverted after the step.
pub const TOOL_RESULTS_KEY: &str = "_tool_results";
pub const TOOL_STATUS_KEY: &str = "_tool_status";
pub const BUDGETS_KEY: &str = "_budgets";
pub const TRACE_KEY: &str = "_trace";
pub const TOOL_SCHEMA_KEY: &str = "_tool_schema";

pub const RESERVED_STATE_KEYS: [&str; 5] = [
    TOOL_RESULTS_KEY,
    TOOL_STATUS_KEY,
    BUDGETS_KEY,
    TRACE_KEY,
    TOOL_SCHEMA_KEY,
];

/// Readiness predicate a session's documents must satisfy before executions
/// may run against it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Every document must be at least `parsed`.
    #[default]
    Lax,
    /// Every document must be `indexed` (search-backed sessions).
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Ready,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Parsed,
    Indexed,
    Failed,
}

/// Pointer set for one document: the raw upload plus the canonical artifacts
/// produced by the parser service.
///
/// `(text_key, offsets_key, checksum, parser_version)` is deterministic for a
/// given raw object version; canonical text is immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub doc_id: String,
    pub raw_key: String,
    /// Object key of the canonical UTF-8 text.
    pub text_key: String,
    /// Object key of the structural metadata sidecar (pages, sections).
    pub meta_key: String,
    /// Object key of the char→byte offset checkpoint table.
    pub offsets_key: String,
    /// `sha256:`-prefixed checksum of the canonical text.
    pub checksum: String,
    pub parser_version: String,
    /// Length of the canonical text in chars.
    pub char_len: usize,
    pub status: DocumentStatus,
}

/// Defaults a session applies to executions that do not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDefaults {
    pub model: String,
    pub subcalls_enabled: bool,
    pub output_mode: OutputMode,
    pub budgets: BudgetSnapshot,
}

/// A corpus plus configuration. Immutable after it becomes `Ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub tenant: String,
    pub documents: Vec<DocumentRef>,
    pub readiness: ReadinessMode,
    pub status: SessionStatus,
    pub defaults: ExecutionDefaults,
    pub created_at: DateTime<Utc>,
    pub ttl_expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the readiness predicate over documents currently holds.
    pub fn documents_ready(&self) -> bool {
        let required = match self.readiness {
            ReadinessMode::Lax => DocumentStatus::Parsed,
            ReadinessMode::Strict => DocumentStatus::Indexed,
        };
        !self.documents.is_empty() && self.documents.iter().all(|d| d.status >= required)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// The orchestrator owns the loop and drives the execution to a terminal
    /// state.
    Answerer,
    /// An external driver advances the execution one step at a time.
    Runtime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputMode {
    /// Finalization produces a free-form answer plus citations.
    #[default]
    Answer,
    /// Finalization produces the `context`-tagged span list instead of an
    /// answer.
    Contexts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    BudgetExceeded,
    MaxTurnsExceeded,
}

impl ExecutionStatus {
    /// Terminal states absorb further signals; cancellation of a terminal
    /// execution is a no-op.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// Requested limits, snapshotted at execution creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSnapshot {
    pub max_turns: u32,
    pub max_total_seconds: u64,
    pub max_step_seconds: u64,
    pub max_llm_subcalls: u32,
    /// Per-request prompt size cap for subcalls.
    pub max_llm_prompt_chars: usize,
    /// Execution-wide prompt char budget across all subcalls.
    pub max_total_llm_prompt_chars: usize,
    pub max_spans_total: usize,
    pub max_spans_per_step: usize,
    pub max_tool_requests_per_step: usize,
    pub max_stdout_chars: usize,
    pub max_state_chars: usize,
}

impl Default for BudgetSnapshot {
    fn default() -> Self {
        Self {
            max_turns: 16,
            max_total_seconds: 600,
            max_step_seconds: 30,
            max_llm_subcalls: 32,
            max_llm_prompt_chars: 64_000,
            max_total_llm_prompt_chars: 512_000,
            max_spans_total: 4_096,
            max_spans_per_step: 512,
            max_tool_requests_per_step: 16,
            max_stdout_chars: 16_384,
            max_state_chars: 4_000_000,
        }
    }
}

/// Accumulated consumption counters. All counters are monotonically
/// non-decreasing within an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumedBudget {
    pub turns: u32,
    pub llm_subcalls: u32,
    pub llm_prompt_chars: usize,
    pub spans: usize,
    pub wall_seconds: u64,
}

/// Optimistic lock in the metadata store so only one orchestrator instance
/// drives a given execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub owner: Option<String>,
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One run against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub session_id: Uuid,
    pub tenant: String,
    pub mode: ExecutionMode,
    pub output_mode: OutputMode,
    pub question: String,
    pub model: String,
    pub subcalls_enabled: bool,
    pub budgets: BudgetSnapshot,
    pub consumed: ConsumedBudget,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<SpanRef>>,
    /// Object key of the final gzipped trace artifact, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_key: Option<String>,
    pub lease: LeaseInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One document range read during a step. Entries are recorded in program
/// order by the corpus view on every byte-read path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanLogEntry {
    pub doc_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Verifiable citation. `checksum` is `sha256:` over the NFC-normalized
/// UTF-8 encoding of the exact canonical slice, so a valid SpanRef re-hashes
/// to the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRef {
    pub tenant: String,
    pub session_id: Uuid,
    pub doc_id: String,
    pub doc_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub checksum: String,
}

/// How a turn's state was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateEnvelope {
    Inline {
        state: Value,
        checksum: String,
    },
    /// Compressed blob in the object store; `summary` keeps top-level key
    /// names and sizes readable without fetching the blob.
    Offloaded {
        uri: String,
        checksum: String,
        summary: Value,
    },
}

impl StateEnvelope {
    pub fn checksum(&self) -> &str {
        match self {
            StateEnvelope::Inline { checksum, .. } => checksum,
            StateEnvelope::Offloaded { checksum, .. } => checksum,
        }
    }

    pub fn pointer(&self) -> StatePointer {
        match self {
            StateEnvelope::Inline { checksum, .. } => StatePointer::Inline {
                checksum: checksum.clone(),
            },
            StateEnvelope::Offloaded {
                uri,
                checksum,
                summary,
            } => StatePointer::Offloaded {
                uri: uri.clone(),
                checksum: checksum.clone(),
                summary: summary.clone(),
            },
        }
    }
}

/// Pointer form of [`StateEnvelope`], embedded in turn records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatePointer {
    Inline { checksum: String },
    Offloaded {
        uri: String,
        checksum: String,
        summary: Value,
    },
}

/// An LLM call queued by sandbox code for out-of-sandbox resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Unique within the execution-turn namespace; re-using a key across
    /// turns replaces its status.
    pub key: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A search query queued by sandbox code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub key: String,
    pub query: String,
    pub k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequests {
    pub llm: Vec<LlmRequest>,
    pub search: Vec<SearchRequest>,
}

impl ToolRequests {
    pub fn is_empty(&self) -> bool {
        self.llm.is_empty() && self.search.is_empty()
    }

    pub fn len(&self) -> usize {
        self.llm.len() + self.search.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Resolved,
    Error,
}

/// Structured error captured on a step or surfaced in the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Hit returned by the optional search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub score: f64,
    pub preview: String,
}

/// Structured result of one sandbox step.
///
/// `success == false` means the step hit an uncaught error; `state` is still
/// populated best-effort so the orchestrator can persist partial progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub stdout: String,
    pub state: Value,
    pub span_log: Vec<SpanLogEntry>,
    pub tool_requests: ToolRequests,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yield_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// Wall-clock breakdown for one turn, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnTimings {
    pub llm_ms: u64,
    pub sandbox_ms: u64,
    pub tool_resolution_ms: u64,
    pub persist_ms: u64,
    pub total_ms: u64,
}

/// Persisted record of one turn. `turn_index` is strictly increasing and
/// gap-free within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub execution_id: Uuid,
    pub turn_index: u32,
    /// The step source, absent when the root output failed to parse.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub stdout: String,
    pub state: StatePointer,
    pub span_log: Vec<SpanLogEntry>,
    pub tool_requests: ToolRequests,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub timings: TurnTimings,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit entry for execution status transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tenant: String,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<ExecutionStatus>,
    pub to: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn execution_status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
            ExecutionStatus::BudgetExceeded,
            ExecutionStatus::MaxTurnsExceeded,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn execution_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&ExecutionStatus::MaxTurnsExceeded).unwrap();
        assert_eq!(json, "\"MAX_TURNS_EXCEEDED\"");
    }

    #[test]
    fn readiness_predicate_over_documents() {
        let doc = |status| DocumentRef {
            doc_id: "d0".to_string(),
            raw_key: "raw/d0".to_string(),
            text_key: "parsed/t/s/d0/text".to_string(),
            meta_key: "parsed/t/s/d0/meta".to_string(),
            offsets_key: "parsed/t/s/d0/offsets".to_string(),
            checksum: "sha256:0".to_string(),
            parser_version: "v1".to_string(),
            char_len: 10,
            status,
        };
        let mut session = Session {
            session_id: Uuid::new_v4(),
            tenant: "t".to_string(),
            documents: vec![doc(DocumentStatus::Parsed)],
            readiness: ReadinessMode::Lax,
            status: SessionStatus::Pending,
            defaults: ExecutionDefaults {
                model: "root-model".to_string(),
                subcalls_enabled: true,
                output_mode: OutputMode::Answer,
                budgets: BudgetSnapshot::default(),
            },
            created_at: Utc::now(),
            ttl_expires_at: None,
        };
        assert!(session.documents_ready());

        session.readiness = ReadinessMode::Strict;
        assert!(!session.documents_ready());

        session.documents = vec![doc(DocumentStatus::Indexed)];
        assert!(session.documents_ready());

        session.documents.clear();
        assert!(!session.documents_ready());
    }

    #[test]
    fn state_envelope_pointer_drops_inline_payload() {
        let envelope = StateEnvelope::Inline {
            state: serde_json::json!({"work": {}}),
            checksum: "sha256:abc".to_string(),
        };
        assert_eq!(
            envelope.pointer(),
            StatePointer::Inline {
                checksum: "sha256:abc".to_string()
            }
        );
    }
}
