//! Trace persistence: one JSON object per turn while the execution runs, one
//! gzipped JSONL artifact at completion.

use std::io::Write;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use rlm_protocol::SpanLogEntry;
use rlm_protocol::StepError;
use rlm_protocol::ToolRequests;
use rlm_protocol::TurnTimings;

use crate::error::Result;
use crate::storage::ObjectStore;
use crate::storage::trace_artifact_key;
use crate::storage::trace_turn_key;

const REDACTED: &str = "[redacted]";

/// Structured per-turn trace record. `root_prompt` and `code` are the
/// model-facing payloads masked by the redaction switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceTurn {
    pub turn_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub stdout: String,
    pub span_log: Vec<SpanLogEntry>,
    pub tool_requests: ToolRequests,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_resolution: Option<Value>,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub timings: TurnTimings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TraceMeta {
    execution_id: Uuid,
    session_id: Uuid,
    tenant: String,
    redacted: bool,
    finished_at: DateTime<Utc>,
}

/// Per-execution trace writer. Turn writes go out immediately as individual
/// objects (never mutated in place); the final artifact is assembled from the
/// in-memory copy at completion.
pub struct TraceWriter {
    store: Arc<dyn ObjectStore>,
    tenant: String,
    session_id: Uuid,
    execution_id: Uuid,
    redact: bool,
    turns: Vec<TraceTurn>,
}

impl TraceWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tenant: impl Into<String>,
        session_id: Uuid,
        execution_id: Uuid,
        redact: bool,
    ) -> Self {
        Self {
            store,
            tenant: tenant.into(),
            session_id,
            execution_id,
            redact,
            turns: Vec::new(),
        }
    }

    fn apply_redaction(&self, turn: &mut TraceTurn) {
        if !self.redact {
            return;
        }
        if turn.root_prompt.is_some() {
            turn.root_prompt = Some(REDACTED.to_string());
        }
        if turn.code.is_some() {
            turn.code = Some(REDACTED.to_string());
        }
        for request in &mut turn.tool_requests.llm {
            request.prompt = REDACTED.to_string();
        }
        if turn.tool_resolution.is_some() {
            turn.tool_resolution = Some(Value::String(REDACTED.to_string()));
        }
    }

    /// Persist one turn record. Trace failures are logged, never fatal: the
    /// execution result matters more than its trace.
    pub async fn record_turn(&mut self, mut turn: TraceTurn) {
        self.apply_redaction(&mut turn);
        let key = trace_turn_key(
            &self.tenant,
            self.session_id,
            self.execution_id,
            turn.turn_index,
        );
        match serde_json::to_vec(&turn) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(&key, bytes, "application/json").await {
                    warn!(key, "trace turn write failed: {e}");
                }
            }
            Err(e) => warn!(key, "trace turn serialize failed: {e}"),
        }
        self.turns.push(turn);
    }

    /// Write the final gzipped JSONL artifact and return its object key.
    pub async fn finish(&self) -> Result<String> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let meta = TraceMeta {
            execution_id: self.execution_id,
            session_id: self.session_id,
            tenant: self.tenant.clone(),
            redacted: self.redact,
            finished_at: Utc::now(),
        };
        let mut write_line = |value: &[u8]| -> std::io::Result<()> {
            encoder.write_all(value)?;
            encoder.write_all(b"\n")
        };
        write_line(&serde_json::to_vec(&meta)?)
            .map_err(|e| crate::error::RlmErr::internal(format!("trace artifact: {e}")))?;
        for turn in &self.turns {
            write_line(&serde_json::to_vec(turn)?)
                .map_err(|e| crate::error::RlmErr::internal(format!("trace artifact: {e}")))?;
        }
        let bytes = encoder
            .finish()
            .map_err(|e| crate::error::RlmErr::internal(format!("trace artifact: {e}")))?;

        let key = trace_artifact_key(&self.tenant, self.session_id, self.execution_id);
        self.store.put(&key, bytes, "application/gzip").await?;
        Ok(key)
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}
