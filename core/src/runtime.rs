//! Runtime mode: the same execution mechanics, advanced one step at a time
//! by an external driver.

use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use rlm_protocol::ExecutionMode;
use rlm_protocol::ExecutionRecord;
use rlm_protocol::ExecutionStatus;
use rlm_protocol::StepResult;
use rlm_protocol::ToolRequests;

use crate::budget::CancelSignal;
use crate::error::Result;
use crate::error::RlmErr;
use crate::orchestrator::Engine;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    /// Resolve queued tool requests before returning, injecting results into
    /// state the same way the managed loop does. When false, the queue is
    /// returned untouched for the driver to resolve explicitly.
    pub resolve_tools: bool,
}

/// Driver-held handle on one RUNTIME-mode execution. Holds the lease for its
/// lifetime; steps are strictly serial through `&mut self`.
pub struct RuntimeSession {
    engine: Engine,
    finished: bool,
}

impl RuntimeSession {
    /// Attach to a RUNTIME-mode execution: acquires the lease and moves it
    /// to RUNNING.
    pub async fn open(
        orchestrator: &Orchestrator,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Self> {
        let (object_store, registry, llm, search, config) = orchestrator.parts();
        let record = registry.get_execution(tenant, execution_id).await?;
        if record.mode != ExecutionMode::Runtime {
            return Err(RlmErr::Validation(
                "execution is not in runtime mode".to_string(),
            ));
        }
        if record.status.is_terminal() {
            return Err(RlmErr::Validation(format!(
                "execution is already terminal: {:?}",
                record.status
            )));
        }
        let session = registry.ready_session(tenant, record.session_id).await?;
        let cancel = CancelSignal::new();
        let engine = Engine::init(
            object_store, registry, llm, search, config, session, record, cancel,
        )
        .await?;
        Ok(Self {
            engine,
            finished: false,
        })
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.engine.record
    }

    pub fn state(&self) -> &Value {
        self.engine.state()
    }

    /// Run one raw-code step (no fenced-block wrapper in runtime mode).
    /// Budget exhaustion terminates the execution exactly like the managed
    /// loop.
    pub async fn step(
        &mut self,
        code: &str,
        state_override: Option<Value>,
        options: StepOptions,
    ) -> Result<StepResult> {
        if self.finished {
            return Err(RlmErr::Validation(
                "execution already reached a terminal state".to_string(),
            ));
        }
        if let Some(status) = self.engine.clock.exceeded(&self.engine.record.consumed) {
            self.finished = true;
            self.engine.terminate(status, "budget exhausted").await?;
            return Err(RlmErr::BudgetExhausted(status));
        }
        if let Some(state) = state_override {
            self.engine.set_state_override(state)?;
        }

        let mut summary = self
            .engine
            .run_turn(Ok(code.to_string()), None, 0, options.resolve_tools)
            .await?;
        if summary.is_final {
            self.finished = true;
            self.engine.complete(summary.answer.take()).await?;
        }
        Ok(summary.result)
    }

    /// Resolve a set of tool requests through the managed path and return
    /// the per-key statuses.
    pub async fn resolve_tools(&mut self, requests: &ToolRequests) -> Result<Value> {
        if self.finished {
            return Err(RlmErr::Validation(
                "execution already reached a terminal state".to_string(),
            ));
        }
        let statuses = self.engine.resolve_requests(requests).await?;
        Ok(json!({"statuses": statuses}))
    }

    /// Idempotent cancel; writes the trace artifact like any termination.
    pub async fn cancel(&mut self) -> Result<ExecutionRecord> {
        if self.finished {
            return self
                .engine
                .registry
                .get_execution(&self.engine.record.tenant, self.engine.record.execution_id)
                .await;
        }
        self.finished = true;
        self.engine.cancel.cancel();
        self.engine
            .terminate(ExecutionStatus::Cancelled, "driver cancel")
            .await
    }
}
