#![expect(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end Answerer-mode scenarios against in-memory drivers and a
//! scripted provider.

mod common;

use common::TENANT;
use common::harness;
use common::repl;

use pretty_assertions::assert_eq;
use rlm_core::CreateExecution;
use rlm_core::citation::span_checksum;
use rlm_protocol::BudgetSnapshot;
use rlm_protocol::ErrorCode;
use rlm_protocol::ExecutionStatus;

const CORPUS: &str = "Hello world from RLM-RS";

#[tokio::test]
async fn trivial_final_produces_answer_and_citation() {
    let h = harness(&[CORPUS]).await;
    h.provider
        .push_response(repl("snippet = context[0][0:5]\ntool.FINAL(snippet)"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "What are the first five chars?".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.answer.as_deref(), Some("Hello"));
    let citations = done.citations.expect("citations");
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].doc_index, 0);
    assert_eq!(citations[0].start_char, 0);
    assert_eq!(citations[0].end_char, 5);
    assert_eq!(citations[0].checksum, span_checksum("Hello"));
    assert!(done.trace_key.is_some());

    // The lease is released on the terminal transition.
    assert_eq!(done.lease.owner, None);
}

#[tokio::test]
async fn subcall_round_trip_consumes_one_subcall() {
    let h = harness(&[CORPUS]).await;
    h.provider.push_response(repl(
        "tool.queue_llm('k', 'echo back: ' + context[0][0:5])\ntool.YIELD('waiting')",
    ));
    h.provider.map_prompt("echo back: Hello", "Hello");
    h.provider.push_response(repl(
        "text = state['_tool_results']['llm']['k']['text']\ntool.FINAL(text)",
    ));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Echo the greeting".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.answer.as_deref(), Some("Hello"));
    assert_eq!(done.consumed.llm_subcalls, 1);
    assert_eq!(done.consumed.turns, 2);

    let citations = done.citations.expect("citations");
    assert_eq!(citations.len(), 1);
    assert_eq!((citations[0].start_char, citations[0].end_char), (0, 5));
}

#[tokio::test]
async fn max_turns_exhaustion_is_terminal_with_exact_turn_count() {
    let h = harness(&[CORPUS]).await;
    // The root model never finalizes.
    h.provider.push_response(repl("print('thinking')"));
    h.provider.push_response(repl("print('still thinking')"));
    h.provider.push_response(repl("print('never reached')"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Loop forever".to_string(),
                budgets: Some(BudgetSnapshot {
                    max_turns: 2,
                    ..BudgetSnapshot::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::MaxTurnsExceeded);
    assert_eq!(done.consumed.turns, 2);
    let turns = h
        .orchestrator
        .registry()
        .list_turns(record.execution_id)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
    assert!(done.trace_key.is_some());
}

#[tokio::test]
async fn ast_rejection_is_surfaced_and_execution_continues() {
    let h = harness(&[CORPUS]).await;
    h.provider.push_response(repl("import os"));
    h.provider.push_response(repl("tool.FINAL('recovered')"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Try something forbidden".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.answer.as_deref(), Some("recovered"));

    let turns = h
        .orchestrator
        .registry()
        .list_turns(record.execution_id)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
    let rejected = &turns[0];
    assert!(!rejected.is_final);
    assert_eq!(
        rejected.error.as_ref().expect("step error").code,
        ErrorCode::SandboxAstRejected
    );
    assert!(rejected.span_log.is_empty());
}

#[tokio::test]
async fn malformed_root_output_records_parse_error_turn() {
    let h = harness(&[CORPUS]).await;
    h.provider.push_response("I'll just talk instead of coding.");
    h.provider.push_response(repl("tool.FINAL('ok')"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Answer please".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    let turns = h
        .orchestrator
        .registry()
        .list_turns(record.execution_id)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].code, None);
    assert_eq!(
        turns[0].error.as_ref().expect("parse error").code,
        ErrorCode::ValidationError
    );
}

#[tokio::test]
async fn turn_indexes_are_gap_free_and_budgets_monotonic() {
    let h = harness(&[CORPUS]).await;
    h.provider.push_response(repl("x = context[0][0:5]"));
    h.provider
        .push_response(repl("tool.queue_llm('a', 'sub one')\ntool.YIELD()"));
    h.provider.map_prompt("sub one", "one");
    h.provider.push_response(repl("tool.FINAL('done')"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Count".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);

    let turns = h
        .orchestrator
        .registry()
        .list_turns(record.execution_id)
        .await
        .unwrap();
    let indexes: Vec<u32> = turns.iter().map(|t| t.turn_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(done.consumed.turns, 3);
    assert_eq!(done.consumed.spans, 1);
    assert_eq!(done.consumed.llm_subcalls, 1);
}

#[tokio::test]
async fn cancellation_is_idempotent_under_concurrency() {
    let h = harness(&[CORPUS]).await;
    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Will be cancelled".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.orchestrator.cancel(TENANT, record.execution_id),
        h.orchestrator.cancel(TENANT, record.execution_id),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.status, ExecutionStatus::Cancelled);
    assert_eq!(b.status, ExecutionStatus::Cancelled);

    // Exactly one transition was recorded; the loser observed the winner.
    let audit = h
        .orchestrator
        .registry()
        .list_audit(TENANT, record.execution_id)
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].to, ExecutionStatus::Cancelled);

    // Running a cancelled execution is a no-op returning the terminal record.
    let after = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();
    assert_eq!(after.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn final_wins_over_queued_tools_in_same_step() {
    let h = harness(&[CORPUS]).await;
    h.provider.push_response(repl(
        "tool.queue_llm('k', 'never resolved')\ntool.FINAL('direct')",
    ));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Tie break".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = h
        .orchestrator
        .run(TENANT, record.execution_id)
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.answer.as_deref(), Some("direct"));
    // The queued request was discarded, not resolved.
    assert_eq!(done.consumed.llm_subcalls, 0);
    // Root call only; the subcall provider was never invoked for it.
    assert_eq!(h.provider.call_count(), 1);
}
