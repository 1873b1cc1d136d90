#![expect(clippy::unwrap_used, clippy::expect_used)]

//! Runtime-mode adapter: one step at a time under driver control.

mod common;

use common::TENANT;
use common::harness;

use pretty_assertions::assert_eq;
use rlm_core::CreateExecution;
use rlm_core::RuntimeSession;
use rlm_core::StepOptions;
use rlm_protocol::ErrorCode;
use rlm_protocol::ExecutionMode;
use rlm_protocol::ExecutionStatus;
use rlm_protocol::LlmRequest;
use rlm_protocol::ToolRequests;
use serde_json::json;

const CORPUS: &str = "Hello world from RLM-RS";

async fn runtime_execution(h: &common::Harness) -> rlm_protocol::ExecutionRecord {
    h.orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "runtime".to_string(),
                mode: Some(ExecutionMode::Runtime),
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn raw_steps_accumulate_state_and_finalize() {
    let h = harness(&[CORPUS]).await;
    let record = runtime_execution(&h).await;
    let mut session = RuntimeSession::open(&h.orchestrator, TENANT, record.execution_id)
        .await
        .unwrap();

    let first = session
        .step("state['work'] = {'n': 1}\n", None, StepOptions::default())
        .await
        .unwrap();
    assert!(first.success);
    assert!(!first.is_final);

    let second = session
        .step(
            "state['work']['n'] = state['work']['n'] + 41\ntool.FINAL(state['work']['n'])\n",
            None,
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert!(second.is_final);
    assert_eq!(second.answer, Some(json!(42)));

    let done = h
        .orchestrator
        .get(TENANT, record.execution_id)
        .await
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(done.trace_key.is_some());

    // Stepping a finished session is rejected.
    assert!(
        session
            .step("x = 1\n", None, StepOptions::default())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn step_with_managed_tool_resolution() {
    let h = harness(&[CORPUS]).await;
    h.provider.map_prompt("summarize: Hello", "a greeting");
    let record = runtime_execution(&h).await;
    let mut session = RuntimeSession::open(&h.orchestrator, TENANT, record.execution_id)
        .await
        .unwrap();

    let step = session
        .step(
            "tool.queue_llm('s', 'summarize: ' + context[0][0:5])\ntool.YIELD()\n",
            None,
            StepOptions {
                resolve_tools: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(step.tool_requests.llm.len(), 1);
    assert_eq!(
        session.state()["_tool_results"]["llm"]["s"]["text"],
        json!("a greeting")
    );
    assert_eq!(session.state()["_tool_status"]["s"], json!("resolved"));
}

#[tokio::test]
async fn unresolved_queue_is_returned_for_explicit_resolution() {
    let h = harness(&[CORPUS]).await;
    h.provider.map_prompt("sub prompt", "sub answer");
    let record = runtime_execution(&h).await;
    let mut session = RuntimeSession::open(&h.orchestrator, TENANT, record.execution_id)
        .await
        .unwrap();

    let step = session
        .step(
            "tool.queue_llm('k', 'sub prompt')\ntool.YIELD()\n",
            None,
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(step.tool_requests.llm.len(), 1);
    // Not resolved yet.
    assert_eq!(session.state()["_tool_status"].get("k"), None);

    let report = session
        .resolve_tools(&ToolRequests {
            llm: vec![LlmRequest {
                key: "k".to_string(),
                prompt: "sub prompt".to_string(),
                model_hint: None,
                max_tokens: None,
                temperature: None,
                metadata: None,
            }],
            search: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(report["statuses"]["k"], json!("resolved"));
    assert_eq!(
        session.state()["_tool_results"]["llm"]["k"]["text"],
        json!("sub answer")
    );
}

#[tokio::test]
async fn state_override_replaces_model_owned_state() {
    let h = harness(&[CORPUS]).await;
    let record = runtime_execution(&h).await;
    let mut session = RuntimeSession::open(&h.orchestrator, TENANT, record.execution_id)
        .await
        .unwrap();

    let step = session
        .step(
            "tool.FINAL(state['injected'])\n",
            Some(json!({"injected": "from driver"})),
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(step.answer, Some(json!("from driver")));
}

#[tokio::test]
async fn ast_rejection_is_returned_to_the_driver() {
    let h = harness(&[CORPUS]).await;
    let record = runtime_execution(&h).await;
    let mut session = RuntimeSession::open(&h.orchestrator, TENANT, record.execution_id)
        .await
        .unwrap();

    let step = session
        .step("import os\n", None, StepOptions::default())
        .await
        .unwrap();
    assert!(!step.success);
    assert_eq!(
        step.error.expect("policy error").code,
        ErrorCode::SandboxAstRejected
    );
    assert!(step.span_log.is_empty());

    // The execution is still alive; the driver decides what to do next.
    let record = h
        .orchestrator
        .get(TENANT, record.execution_id)
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn driver_cancel_is_idempotent_and_writes_trace() {
    let h = harness(&[CORPUS]).await;
    let record = runtime_execution(&h).await;
    let mut session = RuntimeSession::open(&h.orchestrator, TENANT, record.execution_id)
        .await
        .unwrap();
    session
        .step("x = context[0][0:5]\n", None, StepOptions::default())
        .await
        .unwrap();

    let cancelled = session.cancel().await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled.trace_key.is_some());

    let again = session.cancel().await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Cancelled);
}
