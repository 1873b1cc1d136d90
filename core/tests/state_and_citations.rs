#![expect(clippy::unwrap_used, clippy::expect_used)]

//! State offload, checksum determinism, citation verification and CONTEXTS
//! output mode.

mod common;

use common::TENANT;
use common::harness;
use common::harness_with;
use common::repl;

use pretty_assertions::assert_eq;
use rlm_core::CreateExecution;
use rlm_core::RuntimeConfig;
use rlm_core::citation::span_checksum;
use rlm_protocol::ErrorCode;
use rlm_protocol::ExecutionStatus;
use rlm_protocol::OutputMode;
use rlm_protocol::StateEnvelope;

const CORPUS: &str = "Hello world from RLM-RS";

#[tokio::test]
async fn oversized_state_round_trips_through_blob_offload() {
    let config = RuntimeConfig {
        inline_state_cutoff: 256,
        ..RuntimeConfig::default()
    };
    let h = harness_with(&[CORPUS], config).await;
    h.provider.push_response(repl(
        "state['work'] = {'big': 'x' * 300}\ntool.YIELD('stored')",
    ));
    h.provider
        .push_response(repl("tool.FINAL(state['work']['big'][0:5])"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Store something big".to_string(),
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

    // The value written on turn 0 was readable on turn 1.
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.answer.as_deref(), Some("xxxxx"));

    // The persisted envelope is an offloaded blob whose checksum matches
    // the recompressed content.
    let state_item = h
        .orchestrator
        .registry()
        .load_state(record.execution_id)
        .await
        .unwrap()
        .expect("state item");
    match &state_item.envelope {
        StateEnvelope::Offloaded { uri, checksum, summary } => {
            assert!(uri.starts_with(&format!("state/{TENANT}/{}", record.execution_id)));
            assert!(checksum.starts_with("sha256:"));
            assert!(summary.get("work").is_some());
        }
        other => panic!("expected offloaded state, got {other:?}"),
    }
}

#[tokio::test]
async fn state_over_hard_cap_keeps_previous_state() {
    let h = harness(&[CORPUS]).await;
    h.provider
        .push_response(repl("state['work'] = {'keep': 1}\ntool.YIELD()"));
    h.provider
        .push_response(repl("state['work'] = {'huge': 'x' * 5000}"));
    h.provider
        .push_response(repl("tool.FINAL(str(state['work']['keep']))"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Overflow the state".to_string(),
                budgets: Some(rlm_protocol::BudgetSnapshot {
                    max_state_chars: 1_000,
                    ..Default::default()
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

    // Turn 1 failed with STATE_TOO_LARGE but the execution recovered and
    // still saw the turn-0 state afterwards.
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.answer.as_deref(), Some("1"));
    let turns = h
        .orchestrator
        .registry()
        .list_turns(record.execution_id)
        .await
        .unwrap();
    assert_eq!(
        turns[1].error.as_ref().expect("turn error").code,
        ErrorCode::StateTooLarge
    );
}

#[tokio::test]
async fn citation_verify_detects_tampering() {
    let h = harness(&[CORPUS]).await;
    h.provider
        .push_response(repl("tool.FINAL(context[0][0:5])"));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Cite the greeting".to_string(),
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
    let citation = done.citations.expect("citations")[0].clone();

    // Untampered text verifies.
    let ok = h
        .orchestrator
        .verify_citation(TENANT, &citation)
        .await
        .unwrap();
    assert!(ok.valid);
    assert_eq!(ok.cause, None);

    // Same-length tamper of the canonical text flips the verdict.
    let doc = &h.session.documents[0];
    h.object_store
        .corrupt(&doc.text_key, CORPUS.replace('H', "J").into_bytes())
        .await;
    let bad = h
        .orchestrator
        .verify_citation(TENANT, &citation)
        .await
        .unwrap();
    assert!(!bad.valid);
    assert_eq!(bad.cause, Some(ErrorCode::ChecksumMismatch));
}

#[tokio::test]
async fn checksum_is_deterministic_across_independent_reads() {
    let h = harness(&["Ünïcode façade text for hashing"]).await;
    h.provider
        .push_response(repl("a = context[0][0:7]\ntool.FINAL(a)"));
    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Hash it".to_string(),
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
    let citation = &done.citations.expect("citations")[0];

    // Recomputing from an independent read produces the same checksum.
    let expected: String = "Ünïcode".to_string();
    assert_eq!(citation.checksum, span_checksum(&expected));
    let verify = h
        .orchestrator
        .verify_citation(TENANT, citation)
        .await
        .unwrap();
    assert!(verify.valid);
}

#[tokio::test]
async fn overlapping_reads_merge_into_one_citation() {
    let h = harness(&[CORPUS]).await;
    h.provider.push_response(repl(
        "a = context[0][0:8]\nb = context[0][5:11]\nc = context[0][18:23]\ntool.FINAL(a)",
    ));
    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Merge spans".to_string(),
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

    let citations = done.citations.expect("citations");
    let ranges: Vec<(usize, usize)> = citations
        .iter()
        .map(|c| (c.start_char, c.end_char))
        .collect();
    assert_eq!(ranges, vec![(0, 11), (18, 23)]);
    assert_eq!(citations[0].checksum, span_checksum("Hello world"));
}

#[tokio::test]
async fn contexts_mode_returns_tagged_spans_instead_of_answer() {
    let h = harness(&[CORPUS]).await;
    h.provider.push_response(repl(
        "q = context[0].slice(0, 5, 'context')\n\
         noise = context[0][6:11]\n\
         r = context[0].slice(17, 23, 'context:name')\n\
         tool.FINAL(None)",
    ));

    let record = h
        .orchestrator
        .create_execution(
            TENANT,
            h.session.session_id,
            CreateExecution {
                question: "Collect the relevant spans".to_string(),
                output_mode: Some(OutputMode::Contexts),
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
    assert_eq!(done.answer, None);
    let citations = done.citations.expect("citations");
    let ranges: Vec<(usize, usize)> = citations
        .iter()
        .map(|c| (c.start_char, c.end_char))
        .collect();
    // Only context-tagged spans, in discovery order; the untagged read is
    // excluded.
    assert_eq!(ranges, vec![(0, 5), (17, 23)]);
    assert_eq!(citations[0].checksum, span_checksum("Hello"));
    assert_eq!(citations[1].checksum, span_checksum("RLM-RS"));
}
