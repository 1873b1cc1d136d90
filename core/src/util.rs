use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;

/// Default exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms,
/// with ±20% jitter.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << attempt.saturating_sub(1).min(6));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// `sha256:`-prefixed hex digest over raw bytes. Every checksum in the system
/// uses this form.
pub(crate) fn sha256_prefixed(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{digest:x}")
}

/// Canonical JSON bytes: object keys are already sorted because
/// `serde_json::Map` is a BTreeMap in this build (no `preserve_order`).
pub(crate) fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_prefixed_and_deterministic() {
        let a = sha256_prefixed(b"Hello");
        let b = sha256_prefixed(b"Hello");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn canonical_bytes_sort_object_keys() {
        let a = json!({"b": 1, "a": 2});
        let bytes = canonical_json_bytes(&a).unwrap();
        assert_eq!(bytes, br#"{"a":2,"b":1}"#.to_vec());
    }

    #[test]
    fn backoff_grows_and_saturates() {
        assert!(backoff(1) < backoff(4));
        // Attempt numbers beyond the cap do not overflow the shift.
        let _ = backoff(200);
    }
}
