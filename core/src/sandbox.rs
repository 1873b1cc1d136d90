//! Sandbox step runtime: policy gate, restricted evaluation on a blocking
//! thread, reserved-key restore, and structured results.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use rlm_protocol::ErrorCode;
use rlm_protocol::SpanLogEntry;
use rlm_protocol::StepError;
use rlm_protocol::StepResult;
use rlm_protocol::ToolRequests;
use rlm_steplang::EvalError;
use rlm_steplang::EvalErrorKind;
use rlm_steplang::HostErrorKind;
use rlm_steplang::StepLimits;
use rlm_steplang::StepOutcome;
use rlm_steplang::Terminator;

use crate::budget::CancelSignal;
use crate::corpus::BlockingCorpusHost;
use crate::corpus::CorpusView;
use crate::error::Result;
use crate::error::RlmErr;
use crate::error::bounded_details;
use crate::state::graft_reserved_keys;
use crate::state::validate_state;

/// Everything one step execution needs, threaded explicitly.
pub struct StepParams {
    pub code: String,
    pub state: Value,
    pub limits: StepLimits,
    /// Remaining execution-wide span budget, enforced alongside the per-step
    /// cap.
    pub max_spans_per_step: usize,
    pub remaining_spans_total: usize,
    pub step_deadline: Duration,
}

/// Outcome of a dispatch, including how long the sandbox ran.
pub struct SandboxOutput {
    pub result: StepResult,
    pub duration: Duration,
}

/// Validate and execute one step against the corpus. Uncaught step errors
/// come back inside the result; only infrastructure failures surface as
/// `Err`.
pub async fn run_step(
    corpus: Arc<CorpusView>,
    cancel: &CancelSignal,
    params: StepParams,
) -> Result<SandboxOutput> {
    let start = Instant::now();
    if cancel.is_cancelled() {
        return Err(RlmErr::Cancelled);
    }

    validate_state(&params.state).map_err(|e| {
        // A state the orchestrator persisted must already be valid; this is
        // an internal invariant, not a model error.
        RlmErr::internal(format!("invalid state entering sandbox: {e}"))
    })?;

    let program = match rlm_steplang::parse_program(&params.code) {
        Ok(program) => program,
        Err(e) => {
            return Ok(SandboxOutput {
                result: failed_result(
                    &params.state,
                    StepError::new(ErrorCode::ParserError, e.to_string()),
                ),
                duration: start.elapsed(),
            });
        }
    };

    let violations = rlm_steplang::check_policy(&program);
    if !violations.is_empty() {
        let details: Vec<Value> = violations
            .iter()
            .map(|v| json!({"line": v.line, "message": v.message}))
            .collect();
        let first = &violations[0];
        debug!(count = violations.len(), "step rejected by policy");
        return Ok(SandboxOutput {
            result: failed_result(
                &params.state,
                StepError::new(ErrorCode::SandboxAstRejected, first.message.clone())
                    .with_details(bounded_details(Value::Array(details))),
            ),
            duration: start.elapsed(),
        });
    }

    corpus.begin_step(params.max_spans_per_step, params.remaining_spans_total);

    let handle = tokio::runtime::Handle::current();
    let host_view = Arc::clone(&corpus);
    let state_in = params.state.clone();
    let limits = params.limits;
    let job = tokio::task::spawn_blocking(move || {
        let host = BlockingCorpusHost::new(host_view, handle);
        rlm_steplang::run_step(&program, state_in, &host, &limits)
    });

    let outcome: Option<StepOutcome> = tokio::select! {
        joined = job => match joined {
            Ok(outcome) => Some(outcome),
            Err(e) => return Err(RlmErr::internal(format!("sandbox task failed: {e}"))),
        },
        _ = tokio::time::sleep(params.step_deadline) => None,
        _ = cancel.cancelled() => return Err(RlmErr::Cancelled),
    };

    let duration = start.elapsed();
    let span_log = corpus.drain_step_spans();

    let Some(outcome) = outcome else {
        // The blocking task keeps running until its instruction budget
        // expires; its effects are discarded here.
        warn!(deadline_ms = params.step_deadline.as_millis() as u64, "step deadline exceeded");
        let mut result = failed_result(
            &params.state,
            StepError::new(
                ErrorCode::StepTimeout,
                format!(
                    "step exceeded its deadline of {}s",
                    params.step_deadline.as_secs()
                ),
            ),
        );
        result.span_log = span_log;
        return Ok(SandboxOutput { result, duration });
    };

    Ok(SandboxOutput {
        result: assemble_result(&params.state, outcome, span_log),
        duration,
    })
}

fn assemble_result(
    state_before: &Value,
    outcome: StepOutcome,
    span_log: Vec<SpanLogEntry>,
) -> StepResult {
    let mut state = outcome.state;
    // Whatever the step did to orchestrator-owned keys is reverted; if the
    // step rebound `state` to a non-object the previous state wins.
    if state.is_object() {
        graft_reserved_keys(state_before, &mut state);
    } else {
        state = state_before.clone();
    }

    let (is_final, answer, yield_reason) = match outcome.terminator {
        Some(Terminator::Final { answer }) => (true, Some(answer), None),
        Some(Terminator::Yield { reason }) => (false, None, reason),
        None => (false, None, None),
    };

    let error = outcome.error.as_ref().map(map_eval_error);
    StepResult {
        success: error.is_none(),
        stdout: outcome.stdout,
        state,
        span_log,
        tool_requests: outcome.tool_requests,
        is_final,
        answer,
        yield_reason,
        error,
    }
}

fn failed_result(state: &Value, error: StepError) -> StepResult {
    StepResult {
        success: false,
        stdout: String::new(),
        state: state.clone(),
        span_log: Vec::new(),
        tool_requests: ToolRequests::default(),
        is_final: false,
        answer: None,
        yield_reason: None,
        error: Some(error),
    }
}

fn map_eval_error(error: &EvalError) -> StepError {
    let code = match error.kind {
        EvalErrorKind::InstructionLimit => ErrorCode::SandboxLineLimit,
        EvalErrorKind::ToolRequestLimit => ErrorCode::BudgetExceeded,
        EvalErrorKind::Host(HostErrorKind::SpanBudget) => ErrorCode::BudgetExceeded,
        EvalErrorKind::Host(HostErrorKind::Read) => ErrorCode::S3ReadError,
        EvalErrorKind::Host(HostErrorKind::Integrity) => ErrorCode::ChecksumMismatch,
        EvalErrorKind::Host(HostErrorKind::BadPattern) => ErrorCode::ValidationError,
        _ => ErrorCode::SandboxRuntimeError,
    };
    StepError::new(code, error.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::corpus::DocMeta;
    use crate::corpus::OffsetTable;
    use crate::storage::MemObjectStore;
    use crate::storage::ObjectStore as _;
    use crate::storage::parsed_meta_key;
    use crate::storage::parsed_offsets_key;
    use crate::storage::parsed_text_key;
    use pretty_assertions::assert_eq;
    use rlm_protocol::BudgetSnapshot;
    use rlm_protocol::DocumentRef;
    use rlm_protocol::DocumentStatus;
    use rlm_protocol::ExecutionDefaults;
    use rlm_protocol::OutputMode;
    use rlm_protocol::ReadinessMode;
    use rlm_protocol::Session;
    use rlm_protocol::SessionStatus;
    use serde_json::json;
    use uuid::Uuid;

    async fn corpus(texts: &[&str]) -> Arc<CorpusView> {
        let store = Arc::new(MemObjectStore::new());
        let mut session = Session {
            session_id: Uuid::new_v4(),
            tenant: "t".to_string(),
            documents: Vec::new(),
            readiness: ReadinessMode::Lax,
            status: SessionStatus::Ready,
            defaults: ExecutionDefaults {
                model: "root".to_string(),
                subcalls_enabled: true,
                output_mode: OutputMode::Answer,
                budgets: BudgetSnapshot::default(),
            },
            created_at: chrono::Utc::now(),
            ttl_expires_at: None,
        };
        for (i, text) in texts.iter().enumerate() {
            let doc_id = format!("d{i}");
            let text_key = parsed_text_key("t", session.session_id, &doc_id);
            let offsets_key = parsed_offsets_key("t", session.session_id, &doc_id);
            let meta_key = parsed_meta_key("t", session.session_id, &doc_id);
            store
                .put(&text_key, text.as_bytes().to_vec(), "text/plain")
                .await
                .unwrap();
            store
                .put(
                    &offsets_key,
                    serde_json::to_vec(&OffsetTable::build(text, 1024)).unwrap(),
                    "application/json",
                )
                .await
                .unwrap();
            store
                .put(
                    &meta_key,
                    serde_json::to_vec(&DocMeta::default()).unwrap(),
                    "application/json",
                )
                .await
                .unwrap();
            session.documents.push(DocumentRef {
                doc_id,
                raw_key: String::new(),
                text_key,
                meta_key,
                offsets_key,
                checksum: crate::util::sha256_prefixed(text.as_bytes()),
                parser_version: "v1".to_string(),
                char_len: text.chars().count(),
                status: DocumentStatus::Parsed,
            });
        }
        Arc::new(CorpusView::new(store, &session))
    }

    fn params(code: &str, state: Value) -> StepParams {
        StepParams {
            code: code.to_string(),
            state,
            limits: StepLimits::default(),
            max_spans_per_step: 512,
            remaining_spans_total: 4_096,
            step_deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn executes_step_and_collects_spans() {
        let corpus = corpus(&["Hello world from RLM-RS"]).await;
        let cancel = CancelSignal::new();
        let output = run_step(
            corpus,
            &cancel,
            params("snippet = context[0][0:5]\ntool.FINAL(snippet)\n", json!({})),
        )
        .await
        .unwrap();
        assert!(output.result.success);
        assert!(output.result.is_final);
        assert_eq!(output.result.answer, Some(json!("Hello")));
        assert_eq!(
            output.result.span_log,
            vec![SpanLogEntry {
                doc_index: 0,
                start_char: 0,
                end_char: 5,
                tag: None,
            }]
        );
    }

    #[tokio::test]
    async fn ast_rejection_runs_nothing() {
        let corpus = corpus(&["Hello world from RLM-RS"]).await;
        let cancel = CancelSignal::new();
        let state = json!({"work": 1});
        let output = run_step(corpus, &cancel, params("import os\n", state.clone()))
            .await
            .unwrap();
        assert!(!output.result.success);
        let error = output.result.error.expect("expected policy error");
        assert_eq!(error.code, ErrorCode::SandboxAstRejected);
        assert!(output.result.span_log.is_empty());
        assert_eq!(output.result.state, state);
    }

    #[tokio::test]
    async fn reserved_key_mutations_are_reverted() {
        let corpus = corpus(&["Hello world from RLM-RS"]).await;
        let cancel = CancelSignal::new();
        let state = json!({"_tool_status": {"k": "resolved"}, "work": {}});
        let output = run_step(
            corpus,
            &cancel,
            params(
                "state['_tool_status'] = {'k': 'forged'}\nstate['work']['x'] = 1\n",
                state,
            ),
        )
        .await
        .unwrap();
        assert!(output.result.success, "{:?}", output.result.error);
        assert_eq!(
            output.result.state,
            json!({"_tool_status": {"k": "resolved"}, "work": {"x": 1}})
        );
    }

    #[tokio::test]
    async fn instruction_limit_maps_to_line_limit_code() {
        let corpus = corpus(&[]).await;
        let cancel = CancelSignal::new();
        let mut p = params("while True:\n    pass\n", json!({}));
        p.limits.max_instructions = 500;
        let output = run_step(corpus, &cancel, p).await.unwrap();
        assert_eq!(
            output.result.error.expect("expected error").code,
            ErrorCode::SandboxLineLimit
        );
    }

    #[tokio::test]
    async fn parse_failure_is_a_step_error() {
        let corpus = corpus(&[]).await;
        let cancel = CancelSignal::new();
        let output = run_step(corpus, &cancel, params("def broken(:\n", json!({})))
            .await
            .unwrap();
        assert_eq!(
            output.result.error.expect("expected error").code,
            ErrorCode::ParserError
        );
    }

    #[tokio::test]
    async fn cancelled_step_returns_cancelled() {
        let corpus = corpus(&[]).await;
        let cancel = CancelSignal::new();
        cancel.cancel();
        let err = run_step(corpus, &cancel, params("x = 1\n", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RlmErr::Cancelled));
    }
}
