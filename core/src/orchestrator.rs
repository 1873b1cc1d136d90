//! The orchestrator loop: drives executions through prompt → root model →
//! sandbox → persistence → tool resolution until a terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use rlm_protocol::BudgetSnapshot;
use rlm_protocol::ConsumedBudget;
use rlm_protocol::ErrorCode;
use rlm_protocol::ExecutionMode;
use rlm_protocol::ExecutionRecord;
use rlm_protocol::ExecutionStatus;
use rlm_protocol::LeaseInfo;
use rlm_protocol::OutputMode;
use rlm_protocol::Session;
use rlm_protocol::SpanRef;
use rlm_protocol::StepError;
use rlm_protocol::StepResult;
use rlm_protocol::ToolRequests;
use rlm_protocol::TurnRecord;
use rlm_protocol::TurnTimings;
use rlm_steplang::StepLimits;

use crate::budget::BudgetClock;
use crate::budget::CancelSignal;
use crate::citation::SpanAccumulator;
use crate::citation::VerifyOutcome;
use crate::citation::build_span_refs;
use crate::citation::merge_spans;
use crate::citation::verify_span_ref;
use crate::codeblock::extract_repl_block;
use crate::config::RuntimeConfig;
use crate::corpus::CorpusView;
use crate::error::Result;
use crate::error::RlmErr;
use crate::lease::LeaseController;
use crate::prompt::PromptInputs;
use crate::prompt::build_root_prompt;
use crate::prompt::tool_schema;
use crate::providers::LlmCall;
use crate::providers::LlmProvider;
use crate::providers::ProviderErr;
use crate::providers::SearchProvider;
use crate::providers::call_with_retries;
use crate::registry::Registry;
use crate::sandbox;
use crate::sandbox::StepParams;
use crate::state::StateStore;
use crate::storage::MetadataStore;
use crate::storage::ObjectStore;
use crate::tools::ModelsConfig;
use crate::tools::ResolveBudget;
use crate::tools::ToolResolver;
use crate::trace::TraceTurn;
use crate::trace::TraceWriter;

/// Request to create a new execution against a ready session. Unset fields
/// fall back to the session defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateExecution {
    pub question: String,
    pub mode: Option<ExecutionMode>,
    pub output_mode: Option<OutputMode>,
    pub model: Option<String>,
    pub subcalls_enabled: Option<bool>,
    pub budgets: Option<BudgetSnapshot>,
}

pub struct Orchestrator {
    object_store: Arc<dyn ObjectStore>,
    registry: Registry,
    llm: Arc<dyn LlmProvider>,
    search: Option<Arc<dyn SearchProvider>>,
    config: RuntimeConfig,
    cancels: Mutex<HashMap<Uuid, Arc<CancelSignal>>>,
}

impl Orchestrator {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        llm: Arc<dyn LlmProvider>,
        search: Option<Arc<dyn SearchProvider>>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            object_store,
            registry: Registry::new(metadata),
            llm,
            search,
            config,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn cancel_signal(&self, execution_id: Uuid) -> Arc<CancelSignal> {
        let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(cancels.entry(execution_id).or_insert_with(CancelSignal::new))
    }

    fn drop_cancel_signal(&self, execution_id: Uuid) {
        let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        cancels.remove(&execution_id);
    }

    /// Validate the session and register a new PENDING execution.
    pub async fn create_execution(
        &self,
        tenant: &str,
        session_id: Uuid,
        request: CreateExecution,
    ) -> Result<ExecutionRecord> {
        if request.question.trim().is_empty()
            && request.mode.unwrap_or(ExecutionMode::Answerer) == ExecutionMode::Answerer
        {
            return Err(RlmErr::Validation("question must not be empty".to_string()));
        }
        let session = self.registry.ready_session(tenant, session_id).await?;
        let defaults = &session.defaults;
        let now = Utc::now();
        let record = ExecutionRecord {
            execution_id: Uuid::new_v4(),
            session_id,
            tenant: tenant.to_string(),
            mode: request.mode.unwrap_or(ExecutionMode::Answerer),
            output_mode: request.output_mode.unwrap_or(defaults.output_mode),
            question: request.question,
            model: request.model.unwrap_or_else(|| defaults.model.clone()),
            subcalls_enabled: request.subcalls_enabled.unwrap_or(defaults.subcalls_enabled),
            budgets: request.budgets.unwrap_or(defaults.budgets),
            consumed: ConsumedBudget::default(),
            status: ExecutionStatus::Pending,
            answer: None,
            citations: None,
            trace_key: None,
            lease: LeaseInfo::default(),
            created_at: now,
            updated_at: now,
        };
        self.registry.create_execution(&record).await?;
        info!(execution_id = %record.execution_id, mode = ?record.mode, "execution created");
        Ok(record)
    }

    pub async fn get(&self, tenant: &str, execution_id: Uuid) -> Result<ExecutionRecord> {
        self.registry.get_execution(tenant, execution_id).await
    }

    /// Idempotent external cancel: signal any in-flight loop and transition
    /// the record at the same time. Safe to call from any state.
    pub async fn cancel(&self, tenant: &str, execution_id: Uuid) -> Result<ExecutionRecord> {
        let record = self.registry.get_execution(tenant, execution_id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        self.cancel_signal(execution_id).cancel();
        self.registry
            .transition(&record, ExecutionStatus::Cancelled, Some("external cancel".to_string()))
            .await
    }

    /// Drive an Answerer-mode execution to a terminal state and return the
    /// final record.
    pub async fn run(&self, tenant: &str, execution_id: Uuid) -> Result<ExecutionRecord> {
        let record = self.registry.get_execution(tenant, execution_id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        if record.mode != ExecutionMode::Answerer {
            return Err(RlmErr::Validation(
                "runtime-mode executions are driven one step at a time".to_string(),
            ));
        }
        let session = self.registry.ready_session(tenant, record.session_id).await?;
        let cancel = self.cancel_signal(execution_id);

        let result = self.drive(&session, record, &cancel).await;
        self.drop_cancel_signal(execution_id);
        match result {
            Ok(record) => Ok(record),
            // An external cancel (or lease takeover) can land between any
            // two suspension points; whoever wrote the terminal state wins.
            Err(RlmErr::Cancelled) | Err(RlmErr::LeaseConflict(_)) => {
                let record = self.registry.get_execution(tenant, execution_id).await?;
                if record.status.is_terminal() {
                    Ok(record)
                } else {
                    Err(RlmErr::Cancelled)
                }
            }
            // Infrastructure failure after bounded retries: record FAILED.
            Err(e) => {
                let record = self.registry.get_execution(tenant, execution_id).await?;
                if record.status.is_terminal() {
                    return Ok(record);
                }
                warn!(error = %e, "execution failed on infrastructure error");
                self.registry
                    .transition(&record, ExecutionStatus::Failed, Some(e.to_string()))
                    .await
            }
        }
    }

    async fn drive(
        &self,
        session: &Session,
        record: ExecutionRecord,
        cancel: &Arc<CancelSignal>,
    ) -> Result<ExecutionRecord> {
        let mut engine = Engine::init(
            self.object_store.clone(),
            self.registry.clone(),
            self.llm.clone(),
            self.search.clone(),
            self.config.clone(),
            session.clone(),
            record,
            Arc::clone(cancel),
        )
        .await?;

        loop {
            if engine.cancel.is_cancelled() {
                return engine.terminate(ExecutionStatus::Cancelled, "cancelled").await;
            }
            if let Some(status) = engine.clock.exceeded(&engine.record.consumed) {
                return engine.terminate(status, "budget exhausted").await;
            }

            let prompt = engine.build_prompt();
            let llm_started = Instant::now();
            let call = LlmCall {
                model: engine.record.model.clone(),
                prompt: prompt.clone(),
                max_tokens: None,
                temperature: 0.0,
            };
            let deadline = engine.clock.remaining_total().min(Duration::from_secs(120));
            let response = match call_with_retries(
                &engine.llm,
                &call,
                deadline,
                &engine.cancel,
                self.config.max_provider_retries,
            )
            .await
            {
                Ok(response) => response,
                Err(ProviderErr::Cancelled) => {
                    return engine.terminate(ExecutionStatus::Cancelled, "cancelled").await;
                }
                Err(e) => {
                    warn!(error = %e, "root model call failed");
                    return engine
                        .terminate(ExecutionStatus::Failed, &format!("root model: {e}"))
                        .await;
                }
            };
            let llm_ms = llm_started.elapsed().as_millis() as u64;

            let parsed = extract_repl_block(&response.text).map_err(|e| {
                StepError::new(ErrorCode::ValidationError, format!("root output: {e}"))
            });

            let summary = engine.run_turn(parsed, Some(prompt), llm_ms, true).await?;
            if summary.is_final {
                return engine.complete(summary.answer).await;
            }
        }
    }

    /// Re-read a citation's exact range and re-hash it.
    pub async fn verify_citation(&self, tenant: &str, span_ref: &SpanRef) -> Result<VerifyOutcome> {
        let session = self.registry.get_session(tenant, span_ref.session_id).await?;
        let corpus = CorpusView::new(self.object_store.clone(), &session);
        verify_span_ref(&corpus, span_ref).await
    }

    pub(crate) fn parts(
        &self,
    ) -> (
        Arc<dyn ObjectStore>,
        Registry,
        Arc<dyn LlmProvider>,
        Option<Arc<dyn SearchProvider>>,
        RuntimeConfig,
    ) {
        (
            self.object_store.clone(),
            self.registry.clone(),
            self.llm.clone(),
            self.search.clone(),
            self.config.clone(),
        )
    }
}

/// What one turn produced, for the caller's control flow.
pub(crate) struct TurnSummary {
    pub is_final: bool,
    pub answer: Option<Value>,
    pub result: StepResult,
}

/// Per-execution machinery shared by the Answerer loop and the runtime-mode
/// adapter: corpus, state, traces, budgets, lease and turn persistence.
pub(crate) struct Engine {
    pub registry: Registry,
    pub llm: Arc<dyn LlmProvider>,
    pub config: RuntimeConfig,
    pub session: Session,
    pub record: ExecutionRecord,
    pub cancel: Arc<CancelSignal>,
    pub clock: BudgetClock,
    corpus: Arc<CorpusView>,
    state_store: StateStore,
    resolver: ToolResolver,
    lease: LeaseController,
    trace: TraceWriter,
    accumulator: SpanAccumulator,
    state: Value,
    last_stdout: Option<String>,
    last_error: Option<StepError>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn init(
        object_store: Arc<dyn ObjectStore>,
        registry: Registry,
        llm: Arc<dyn LlmProvider>,
        search: Option<Arc<dyn SearchProvider>>,
        config: RuntimeConfig,
        session: Session,
        record: ExecutionRecord,
        cancel: Arc<CancelSignal>,
    ) -> Result<Self> {
        let lease = LeaseController::new(
            registry.metadata(),
            config.lease_owner.clone(),
            config.lease_ttl_seconds,
        );
        let record = lease.acquire(&record).await?;
        let record = registry
            .transition(&record, ExecutionStatus::Running, None)
            .await?;
        if record.status != ExecutionStatus::Running {
            // Raced with an external cancel before the first turn.
            return Err(RlmErr::Cancelled);
        }

        let corpus = Arc::new(CorpusView::new(object_store.clone(), &session));
        let state_store = StateStore::new(object_store.clone(), config.inline_state_cutoff);
        let resolver = ToolResolver::new(
            llm.clone(),
            search,
            object_store.clone(),
            record.tenant.clone(),
            config.tool_resolution_max_concurrency,
            config.max_provider_retries,
        );
        let trace = TraceWriter::new(
            object_store,
            record.tenant.clone(),
            record.session_id,
            record.execution_id,
            config.redact_traces,
        );

        let state = match registry.load_state(record.execution_id).await? {
            Some(item) => state_store.load(&item.envelope).await?,
            None => json!({
                rlm_protocol::TOOL_RESULTS_KEY: {"llm": {}, "search": {}},
                rlm_protocol::TOOL_STATUS_KEY: {},
            }),
        };

        // Replay earlier turns' spans so citations cover the whole
        // execution after a lease takeover.
        let mut accumulator = SpanAccumulator::new();
        for turn in registry.list_turns(record.execution_id).await? {
            accumulator.record_turn(turn.turn_index, &turn.span_log);
        }

        let clock = BudgetClock::new(record.budgets);
        Ok(Self {
            registry,
            llm,
            config,
            session,
            record,
            cancel,
            clock,
            corpus,
            state_store,
            resolver,
            lease,
            trace,
            accumulator,
            state,
            last_stdout: None,
            last_error: None,
        })
    }

    pub(crate) fn state(&self) -> &Value {
        &self.state
    }

    pub(crate) fn set_state_override(&mut self, state: Value) -> Result<()> {
        crate::state::validate_state(&state)?;
        self.state = state;
        Ok(())
    }

    pub(crate) fn build_prompt(&self) -> String {
        let doc_lens = self.corpus.doc_lens();
        build_root_prompt(&PromptInputs {
            question: &self.record.question,
            doc_lens: &doc_lens,
            subcalls_enabled: self.record.subcalls_enabled,
            output_mode: self.record.output_mode,
            state: &self.state,
            last_stdout: self.last_stdout.as_deref(),
            last_error: self.last_error.as_ref(),
            budgets: &self.record.budgets,
            consumed: &self.record.consumed,
            turn_index: self.record.consumed.turns,
        })
    }

    /// Refresh the orchestrator-owned keys the sandbox may read.
    fn inject_reserved_keys(&mut self) {
        if let Value::Object(map) = &mut self.state {
            map.insert(
                rlm_protocol::TOOL_SCHEMA_KEY.to_string(),
                tool_schema(),
            );
            let budgets = &self.record.budgets;
            let consumed = &self.record.consumed;
            map.insert(
                rlm_protocol::BUDGETS_KEY.to_string(),
                json!({
                    "turns_remaining": budgets.max_turns.saturating_sub(consumed.turns),
                    "subcalls_remaining": budgets.max_llm_subcalls.saturating_sub(consumed.llm_subcalls),
                    "spans_remaining": budgets.max_spans_total.saturating_sub(consumed.spans),
                    "prompt_chars_remaining": budgets.max_total_llm_prompt_chars.saturating_sub(consumed.llm_prompt_chars),
                }),
            );
            map.insert(
                rlm_protocol::TRACE_KEY.to_string(),
                json!({"turns": consumed.turns}),
            );
        }
    }

    /// Execute one turn: dispatch the (already parsed) step, resolve any
    /// queued tools, persist state + turn + trace, advance counters.
    ///
    /// `code` carries the parse outcome: `Err` records a parse-failure turn
    /// that runs no sandbox code but still consumes a turn and feeds the
    /// error into the next prompt.
    pub(crate) async fn run_turn(
        &mut self,
        code: std::result::Result<String, StepError>,
        root_prompt: Option<String>,
        llm_ms: u64,
        resolve_tools: bool,
    ) -> Result<TurnSummary> {
        let turn_started = Instant::now();
        let turn_index = self.record.consumed.turns;
        self.inject_reserved_keys();

        let (code_text, mut result, sandbox_ms) = match code {
            Err(parse_error) => {
                debug!(turn_index, "recording parse-failure turn");
                let result = StepResult {
                    success: false,
                    stdout: String::new(),
                    state: self.state.clone(),
                    span_log: Vec::new(),
                    tool_requests: ToolRequests::default(),
                    is_final: false,
                    answer: None,
                    yield_reason: None,
                    error: Some(parse_error),
                };
                (None, result, 0)
            }
            Ok(code) => {
                let remaining_spans = self
                    .record
                    .budgets
                    .max_spans_total
                    .saturating_sub(self.record.consumed.spans);
                let output = sandbox::run_step(
                    Arc::clone(&self.corpus),
                    &self.cancel,
                    StepParams {
                        code: code.clone(),
                        state: self.state.clone(),
                        limits: StepLimits {
                            max_instructions: self.config.max_step_instructions,
                            max_stdout_chars: self.record.budgets.max_stdout_chars,
                            max_tool_requests: self.record.budgets.max_tool_requests_per_step,
                        },
                        max_spans_per_step: self.record.budgets.max_spans_per_step,
                        remaining_spans_total: remaining_spans,
                        step_deadline: self.clock.step_deadline(),
                    },
                )
                .await?;
                let sandbox_ms = output.duration.as_millis() as u64;
                (Some(code), output.result, sandbox_ms)
            }
        };

        // Tie-break: finalization wins, queued tool requests are discarded.
        let mut tool_resolution: Option<Value> = None;
        let mut tool_ms = 0u64;
        if result.is_final {
            if !result.tool_requests.is_empty() {
                debug!(turn_index, "discarding tool requests on final step");
                result.tool_requests = ToolRequests::default();
            }
        } else if resolve_tools && !result.tool_requests.is_empty() {
            let tool_started = Instant::now();
            let budgets = &self.record.budgets;
            let consumed = &self.record.consumed;
            let remaining_subcalls = if self.record.subcalls_enabled {
                budgets.max_llm_subcalls.saturating_sub(consumed.llm_subcalls)
            } else {
                0
            };
            let report = self
                .resolver
                .resolve(
                    &result.tool_requests,
                    &ModelsConfig {
                        default_model: self.record.model.clone(),
                    },
                    ResolveBudget {
                        remaining_subcalls,
                        remaining_prompt_chars: budgets
                            .max_total_llm_prompt_chars
                            .saturating_sub(consumed.llm_prompt_chars),
                        max_prompt_chars_per_request: budgets.max_llm_prompt_chars,
                        per_call_deadline: self.clock.remaining_total().min(Duration::from_secs(60)),
                    },
                    &self.cancel,
                )
                .await;
            report.merge_into_state(&mut result.state);
            self.record.consumed.llm_subcalls += report.subcalls_used;
            self.record.consumed.llm_prompt_chars += report.prompt_chars_used;
            tool_resolution = Some(json!({
                "statuses": report.statuses,
                "cache_hits": report.cache_hits,
            }));
            tool_ms = tool_started.elapsed().as_millis() as u64;
        }

        // Persist the post-turn state. An oversized state keeps the previous
        // one and surfaces the failure as the turn's error.
        let persist_started = Instant::now();
        let max_state = self.record.budgets.max_state_chars;
        let envelope = match self
            .state_store
            .persist(
                &self.record.tenant,
                self.record.execution_id,
                turn_index,
                &result.state,
                max_state,
            )
            .await
        {
            Ok(envelope) => {
                self.state = result.state.clone();
                envelope
            }
            Err(e @ RlmErr::StateTooLarge { .. }) => {
                warn!(turn_index, "state over hard cap, reverting");
                result.error = Some(StepError::new(ErrorCode::StateTooLarge, e.to_string()));
                result.success = false;
                self.state_store
                    .persist(
                        &self.record.tenant,
                        self.record.execution_id,
                        turn_index,
                        &self.state,
                        max_state,
                    )
                    .await?
            }
            Err(e) => return Err(e),
        };
        self.registry
            .save_state(self.record.execution_id, turn_index, &envelope)
            .await?;

        self.accumulator.record_turn(turn_index, &result.span_log);
        self.record.consumed.turns += 1;
        self.record.consumed.spans += result.span_log.len();
        self.record.consumed.wall_seconds = self.clock.elapsed_seconds();
        let persist_ms = persist_started.elapsed().as_millis() as u64;

        let timings = TurnTimings {
            llm_ms,
            sandbox_ms,
            tool_resolution_ms: tool_ms,
            persist_ms,
            total_ms: turn_started.elapsed().as_millis() as u64 + llm_ms,
        };
        let turn = TurnRecord {
            execution_id: self.record.execution_id,
            turn_index,
            code: code_text.clone(),
            stdout: result.stdout.clone(),
            state: envelope.pointer(),
            span_log: result.span_log.clone(),
            tool_requests: result.tool_requests.clone(),
            is_final: result.is_final,
            answer: result.answer.clone(),
            error: result.error.clone(),
            timings,
            created_at: Utc::now(),
        };
        self.registry.save_turn(&turn).await?;
        self.trace
            .record_turn(TraceTurn {
                turn_index,
                root_prompt,
                code: code_text,
                stdout: result.stdout.clone(),
                span_log: result.span_log.clone(),
                tool_requests: result.tool_requests.clone(),
                tool_resolution,
                is_final: result.is_final,
                error: result.error.clone(),
                timings,
                created_at: turn.created_at,
            })
            .await;

        self.record = self.lease.renew(&self.record).await?;

        self.last_stdout = Some(result.stdout.clone());
        self.last_error = result.error.clone();
        Ok(TurnSummary {
            is_final: result.is_final,
            answer: result.answer.clone(),
            result,
        })
    }

    /// Managed tool resolution outside a step (runtime-mode drivers). Merges
    /// results into state, persists it under the latest turn index and
    /// returns per-key statuses.
    pub(crate) async fn resolve_requests(
        &mut self,
        requests: &ToolRequests,
    ) -> Result<std::collections::BTreeMap<String, rlm_protocol::ToolStatus>> {
        let budgets = &self.record.budgets;
        let consumed = &self.record.consumed;
        let remaining_subcalls = if self.record.subcalls_enabled {
            budgets.max_llm_subcalls.saturating_sub(consumed.llm_subcalls)
        } else {
            0
        };
        let report = self
            .resolver
            .resolve(
                requests,
                &ModelsConfig {
                    default_model: self.record.model.clone(),
                },
                ResolveBudget {
                    remaining_subcalls,
                    remaining_prompt_chars: budgets
                        .max_total_llm_prompt_chars
                        .saturating_sub(consumed.llm_prompt_chars),
                    max_prompt_chars_per_request: budgets.max_llm_prompt_chars,
                    per_call_deadline: self.clock.remaining_total().min(Duration::from_secs(60)),
                },
                &self.cancel,
            )
            .await;

        let mut state = self.state.clone();
        report.merge_into_state(&mut state);
        let turn_index = self.record.consumed.turns.saturating_sub(1);
        let envelope = self
            .state_store
            .persist(
                &self.record.tenant,
                self.record.execution_id,
                turn_index,
                &state,
                self.record.budgets.max_state_chars,
            )
            .await?;
        self.registry
            .save_state(self.record.execution_id, turn_index, &envelope)
            .await?;
        self.state = state;
        self.record.consumed.llm_subcalls += report.subcalls_used;
        self.record.consumed.llm_prompt_chars += report.prompt_chars_used;
        self.record = self.lease.renew(&self.record).await?;
        Ok(report.statuses)
    }

    /// Assemble citations per output mode and transition to COMPLETED.
    pub(crate) async fn complete(&mut self, answer: Option<Value>) -> Result<ExecutionRecord> {
        let citations = match self.record.output_mode {
            OutputMode::Answer => {
                let merged =
                    merge_spans(self.accumulator.entries(), self.config.merge_gap_chars);
                build_span_refs(&self.corpus, &self.session, &merged).await?
            }
            OutputMode::Contexts => {
                let spans: Vec<(usize, usize, usize)> = self
                    .accumulator
                    .context_spans()
                    .iter()
                    .map(|s| (s.doc_index, s.start_char, s.end_char))
                    .collect();
                build_span_refs(&self.corpus, &self.session, &spans).await?
            }
        };
        let answer_text = match self.record.output_mode {
            OutputMode::Contexts => None,
            OutputMode::Answer => answer.map(|value| match value {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        };

        let trace_key = self.trace.finish().await?;
        self.record.answer = answer_text;
        self.record.citations = Some(citations);
        self.record.trace_key = Some(trace_key);
        let completed = self
            .registry
            .transition(&self.record, ExecutionStatus::Completed, None)
            .await?;
        info!(execution_id = %completed.execution_id, turns = completed.consumed.turns, "execution completed");
        Ok(completed)
    }

    /// Terminal transition for budget/timeout/cancel/failure paths; persists
    /// the trace artifact first so the pointer survives.
    pub(crate) async fn terminate(
        &mut self,
        status: ExecutionStatus,
        reason: &str,
    ) -> Result<ExecutionRecord> {
        match self.trace.finish().await {
            Ok(key) => self.record.trace_key = Some(key),
            Err(e) => warn!("trace artifact write failed: {e}"),
        }
        let record = self
            .registry
            .transition(&self.record, status, Some(reason.to_string()))
            .await?;
        info!(execution_id = %record.execution_id, status = ?record.status, reason, "execution terminated");
        Ok(record)
    }
}

