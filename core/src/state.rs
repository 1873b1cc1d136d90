//! JSON state validation, sizing, checksumming and blob offload.

use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use rlm_protocol::RESERVED_STATE_KEYS;
use rlm_protocol::StateEnvelope;

use crate::error::Result;
use crate::error::RlmErr;
use crate::storage::ObjectStore;
use crate::storage::state_blob_key;
use crate::util::canonical_json_bytes;
use crate::util::sha256_prefixed;

const MAX_STATE_DEPTH: usize = 64;

pub struct StateStore {
    store: Arc<dyn ObjectStore>,
    inline_cutoff: usize,
}

impl StateStore {
    pub fn new(store: Arc<dyn ObjectStore>, inline_cutoff: usize) -> Self {
        Self {
            store,
            inline_cutoff,
        }
    }

    /// Validate, size and persist one turn's state. Inline under the cutoff,
    /// gzip blob above it, hard failure over `max_state_bytes`.
    pub async fn persist(
        &self,
        tenant: &str,
        execution_id: Uuid,
        turn_index: u32,
        state: &Value,
        max_state_bytes: usize,
    ) -> Result<StateEnvelope> {
        validate_state(state)?;
        let bytes = canonical_json_bytes(state)?;
        if bytes.len() > max_state_bytes {
            return Err(RlmErr::StateTooLarge {
                size: bytes.len(),
                max: max_state_bytes,
            });
        }
        let checksum = sha256_prefixed(&bytes);
        if bytes.len() <= self.inline_cutoff {
            return Ok(StateEnvelope::Inline {
                state: state.clone(),
                checksum,
            });
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&bytes)
            .map_err(|e| RlmErr::internal(format!("gzip state: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| RlmErr::internal(format!("gzip state: {e}")))?;
        let key = state_blob_key(tenant, execution_id, turn_index);
        debug!(
            key,
            raw = bytes.len(),
            compressed = compressed.len(),
            "offloading state blob"
        );
        self.store.put(&key, compressed, "application/gzip").await?;
        Ok(StateEnvelope::Offloaded {
            uri: key,
            checksum,
            summary: summarize_state(state),
        })
    }

    /// Load a persisted state, verifying the stored checksum on the blob
    /// path.
    pub async fn load(&self, envelope: &StateEnvelope) -> Result<Value> {
        match envelope {
            StateEnvelope::Inline { state, .. } => Ok(state.clone()),
            StateEnvelope::Offloaded { uri, checksum, .. } => {
                let compressed = self.store.get(uri, None).await?;
                let mut decoder = GzDecoder::new(compressed.as_slice());
                let mut bytes = Vec::new();
                decoder
                    .read_to_end(&mut bytes)
                    .map_err(|e| RlmErr::internal(format!("gunzip state: {e}")))?;
                if sha256_prefixed(&bytes) != *checksum {
                    return Err(RlmErr::ChecksumMismatch(uri.clone()));
                }
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}

/// Accept only JSON objects at the top level, with nothing beyond JSON
/// primitives, arrays and (finitely nested) objects inside.
pub fn validate_state(state: &Value) -> Result<()> {
    let Value::Object(_) = state else {
        return Err(RlmErr::StateInvalidType(format!(
            "state must be a JSON object, got {}",
            type_label(state)
        )));
    };
    check_depth(state, 0)
}

fn check_depth(value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_STATE_DEPTH {
        return Err(RlmErr::StateInvalidType(format!(
            "state nests deeper than {MAX_STATE_DEPTH} levels"
        )));
    }
    match value {
        Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                check_depth(item, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compact summary stored next to offloaded blobs and shown in prompts:
/// top-level key names and their canonical byte sizes.
pub fn summarize_state(state: &Value) -> Value {
    let Value::Object(map) = state else {
        return Value::Null;
    };
    let mut summary = Map::new();
    for (key, value) in map {
        let size = canonical_json_bytes(value).map(|b| b.len()).unwrap_or(0);
        summary.insert(key.clone(), Value::from(size));
    }
    Value::Object(summary)
}

/// Graft the orchestrator-owned sub-trees from `authoritative` onto `next`,
/// discarding whatever the sandbox did to them. Reserved keys absent from
/// `authoritative` are removed outright.
pub fn graft_reserved_keys(authoritative: &Value, next: &mut Value) {
    let Value::Object(next_map) = next else {
        return;
    };
    let authoritative = match authoritative {
        Value::Object(map) => Some(map),
        _ => None,
    };
    for key in RESERVED_STATE_KEYS {
        match authoritative.and_then(|m| m.get(key)) {
            Some(value) => {
                next_map.insert(key.to_string(), value.clone());
            }
            None => {
                next_map.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::storage::MemObjectStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemObjectStore::new()), 64)
    }

    #[tokio::test]
    async fn small_state_round_trips_inline() {
        let store = store();
        let state = json!({"work": {"n": 1}});
        let envelope = store
            .persist("t", Uuid::new_v4(), 0, &state, 10_000)
            .await
            .unwrap();
        assert!(matches!(envelope, StateEnvelope::Inline { .. }));
        assert_eq!(store.load(&envelope).await.unwrap(), state);
    }

    #[tokio::test]
    async fn large_state_round_trips_via_blob_with_matching_checksum() {
        let store = store();
        let state = json!({"work": {"big": "x".repeat(500)}});
        let envelope = store
            .persist("t", Uuid::new_v4(), 3, &state, 10_000)
            .await
            .unwrap();
        match &envelope {
            StateEnvelope::Offloaded { uri, summary, .. } => {
                assert!(uri.contains("state_3"));
                // {"big":"x…x"} = 8 bytes of structure + 502 for the string.
                assert_eq!(summary["work"], json!(510));
            }
            other => panic!("expected offloaded envelope, got {other:?}"),
        }
        assert_eq!(store.load(&envelope).await.unwrap(), state);
    }

    #[tokio::test]
    async fn oversized_state_is_rejected() {
        let store = store();
        let state = json!({"big": "x".repeat(2_000)});
        let err = store
            .persist("t", Uuid::new_v4(), 0, &state, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, RlmErr::StateTooLarge { .. }));
    }

    #[tokio::test]
    async fn tampered_blob_fails_checksum() {
        let object_store = Arc::new(MemObjectStore::new());
        let store = StateStore::new(object_store.clone(), 8);
        let state = json!({"work": "x".repeat(100)});
        let envelope = store
            .persist("t", Uuid::nil(), 0, &state, 10_000)
            .await
            .unwrap();
        let StateEnvelope::Offloaded { uri, .. } = &envelope else {
            panic!("expected blob");
        };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"work":"tampered"}"#).unwrap();
        object_store.corrupt(uri, encoder.finish().unwrap()).await;

        let err = store.load(&envelope).await.unwrap_err();
        assert!(matches!(err, RlmErr::ChecksumMismatch(_)));
    }

    #[test]
    fn non_object_state_is_invalid() {
        assert!(matches!(
            validate_state(&json!([1, 2])),
            Err(RlmErr::StateInvalidType(_))
        ));
        assert!(validate_state(&json!({"a": [1, {"b": null}]})).is_ok());
    }

    #[test]
    fn reserved_keys_are_grafted_back() {
        let authoritative = json!({
            "_tool_results": {"llm": {"k": {"text": "hi"}}},
            "_tool_status": {"k": "resolved"},
            "work": "theirs",
        });
        let mut next = json!({
            "_tool_results": {"llm": {}},
            "_budgets": {"forged": true},
            "work": "mine",
        });
        graft_reserved_keys(&authoritative, &mut next);
        assert_eq!(next["_tool_results"], authoritative["_tool_results"]);
        assert_eq!(next["_tool_status"], authoritative["_tool_status"]);
        // Forged key the orchestrator never wrote is dropped.
        assert!(next.get("_budgets").is_none());
        // Model-owned keys are untouched.
        assert_eq!(next["work"], json!("mine"));
    }
}
