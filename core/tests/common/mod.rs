//! Shared harness for the integration suite: in-memory stores, a seeded
//! ready session, and a scripted root/subcall provider.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use rlm_core::Orchestrator;
use rlm_core::RuntimeConfig;
use rlm_core::corpus::DocMeta;
use rlm_core::corpus::OffsetTable;
use rlm_core::providers::ScriptedLlmProvider;
use rlm_core::storage::MemMetadataStore;
use rlm_core::storage::MemObjectStore;
use rlm_core::storage::ObjectStore as _;
use rlm_core::storage::parsed_meta_key;
use rlm_core::storage::parsed_offsets_key;
use rlm_core::storage::parsed_text_key;
use rlm_protocol::BudgetSnapshot;
use rlm_protocol::DocumentRef;
use rlm_protocol::DocumentStatus;
use rlm_protocol::ExecutionDefaults;
use rlm_protocol::OutputMode;
use rlm_protocol::ReadinessMode;
use rlm_protocol::Session;
use rlm_protocol::SessionStatus;

pub const TENANT: &str = "tenant-a";

#[allow(dead_code)]
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub object_store: Arc<MemObjectStore>,
    pub metadata: Arc<MemMetadataStore>,
    pub provider: Arc<ScriptedLlmProvider>,
    pub session: Session,
}

pub async fn harness(texts: &[&str]) -> Harness {
    harness_with(texts, RuntimeConfig::default()).await
}

pub async fn harness_with(texts: &[&str], config: RuntimeConfig) -> Harness {
    let object_store = Arc::new(MemObjectStore::new());
    let metadata = Arc::new(MemMetadataStore::new());
    let provider = Arc::new(ScriptedLlmProvider::new());

    let session = seed_session(&object_store, texts, config.offset_checkpoint_interval).await;
    let orchestrator = Orchestrator::new(
        object_store.clone(),
        metadata.clone(),
        provider.clone(),
        None,
        config,
    );
    orchestrator
        .registry()
        .put_session(&session)
        .await
        .expect("seed session");

    Harness {
        orchestrator,
        object_store,
        metadata,
        provider,
        session,
    }
}

async fn seed_session(
    store: &Arc<MemObjectStore>,
    texts: &[&str],
    checkpoint_interval: usize,
) -> Session {
    let session_id = Uuid::new_v4();
    let mut documents = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        let doc_id = format!("doc-{i}");
        let text_key = parsed_text_key(TENANT, session_id, &doc_id);
        let offsets_key = parsed_offsets_key(TENANT, session_id, &doc_id);
        let meta_key = parsed_meta_key(TENANT, session_id, &doc_id);
        store
            .put(&text_key, text.as_bytes().to_vec(), "text/plain; charset=utf-8")
            .await
            .expect("seed text");
        store
            .put(
                &offsets_key,
                serde_json::to_vec(&OffsetTable::build(text, checkpoint_interval))
                    .expect("offsets json"),
                "application/json",
            )
            .await
            .expect("seed offsets");
        store
            .put(
                &meta_key,
                serde_json::to_vec(&DocMeta::default()).expect("meta json"),
                "application/json",
            )
            .await
            .expect("seed meta");
        documents.push(DocumentRef {
            doc_id,
            raw_key: format!("raw/{i}"),
            text_key,
            meta_key,
            offsets_key,
            checksum: rlm_core::citation::span_checksum(text),
            parser_version: "parser-v1".to_string(),
            char_len: text.chars().count(),
            status: DocumentStatus::Parsed,
        });
    }

    Session {
        session_id,
        tenant: TENANT.to_string(),
        documents,
        readiness: ReadinessMode::Lax,
        status: SessionStatus::Ready,
        defaults: ExecutionDefaults {
            model: "root-model".to_string(),
            subcalls_enabled: true,
            output_mode: OutputMode::Answer,
            budgets: BudgetSnapshot::default(),
        },
        created_at: Utc::now(),
        ttl_expires_at: None,
    }
}

/// Wrap step source in the fenced block the root-output parser expects.
#[allow(dead_code)]
pub fn repl(code: &str) -> String {
    format!("```repl\n{code}\n```")
}
