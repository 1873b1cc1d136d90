//! Key layout for the object store and the metadata keyspace. Everything is
//! partitioned by tenant; canonical parsed artifacts additionally by session.

use uuid::Uuid;

// ---------------------------------------------------------------------------
// Object store keys
// ---------------------------------------------------------------------------

pub fn parsed_text_key(tenant: &str, session_id: Uuid, doc_id: &str) -> String {
    format!("parsed/{tenant}/{session_id}/{doc_id}/text")
}

pub fn parsed_meta_key(tenant: &str, session_id: Uuid, doc_id: &str) -> String {
    format!("parsed/{tenant}/{session_id}/{doc_id}/meta")
}

pub fn parsed_offsets_key(tenant: &str, session_id: Uuid, doc_id: &str) -> String {
    format!("parsed/{tenant}/{session_id}/{doc_id}/offsets")
}

pub fn state_blob_key(tenant: &str, execution_id: Uuid, turn_index: u32) -> String {
    format!("state/{tenant}/{execution_id}/state_{turn_index}.json.gz")
}

pub fn trace_turn_key(tenant: &str, session_id: Uuid, execution_id: Uuid, turn_index: u32) -> String {
    format!("traces/{tenant}/{session_id}/{execution_id}/turn_{turn_index:06}.json")
}

pub fn trace_artifact_key(tenant: &str, session_id: Uuid, execution_id: Uuid) -> String {
    format!("traces/{tenant}/{session_id}/{execution_id}.jsonl.gz")
}

pub fn cache_llm_key(tenant: &str, hash: &str) -> String {
    format!("cache/{tenant}/llm/{hash}")
}

pub fn cache_search_key(tenant: &str, hash: &str) -> String {
    format!("cache/{tenant}/search/{hash}")
}

pub fn cache_prefix(tenant: &str) -> String {
    format!("cache/{tenant}/")
}

// ---------------------------------------------------------------------------
// Metadata keyspace
// ---------------------------------------------------------------------------

pub fn tenant_pk(tenant: &str) -> String {
    format!("TENANT#{tenant}")
}

pub fn session_sk(session_id: Uuid) -> String {
    format!("SESSION#{session_id}")
}

pub fn execution_sk(execution_id: Uuid) -> String {
    format!("EXEC#{execution_id}")
}

pub fn execution_pk(execution_id: Uuid) -> String {
    format!("EXEC#{execution_id}")
}

pub const STATE_SK: &str = "STATE";

pub fn turn_sk(turn_index: u32) -> String {
    format!("TURN#{turn_index:06}")
}

pub const TURN_SK_PREFIX: &str = "TURN#";

pub fn audit_sk(execution_id: Uuid, seq: u64) -> String {
    format!("AUDIT#{execution_id}#{seq:06}")
}
