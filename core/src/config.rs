use serde::Deserialize;
use serde::Serialize;

use rlm_protocol::BudgetSnapshot;

/// Runtime configuration threaded through the orchestrator explicitly; there
/// are no process-wide singletons. Hosts deserialize this from their own
/// config file and pass it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Budgets applied when neither the session nor the request overrides
    /// them.
    pub default_budgets: BudgetSnapshot,

    /// Serialized states at or under this byte size are stored inline in
    /// metadata; larger states are gzipped into the object store.
    pub inline_state_cutoff: usize,

    /// Adjacent merged spans closer than this many chars are coalesced into
    /// one citation.
    pub merge_gap_chars: usize,

    pub tool_resolution_max_concurrency: usize,

    /// Char interval of the offsets checkpoint table written by the parser
    /// service; reads fall back to a linear scan inside one interval.
    pub offset_checkpoint_interval: usize,

    /// Mask prompts and model outputs in persisted traces.
    pub redact_traces: bool,

    /// Evaluator instruction budget per step; exceeding it surfaces
    /// `SANDBOX_LINE_LIMIT` on the turn.
    pub max_step_instructions: u64,

    /// Bounded retries for provider and infrastructure calls.
    pub max_provider_retries: u32,
    pub max_infra_retries: u32,

    /// Identity this orchestrator instance writes into leases.
    pub lease_owner: String,
    pub lease_ttl_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_budgets: BudgetSnapshot::default(),
            inline_state_cutoff: 32 * 1024,
            merge_gap_chars: 0,
            tool_resolution_max_concurrency: 4,
            offset_checkpoint_interval: 1024,
            redact_traces: false,
            max_step_instructions: 200_000,
            max_provider_retries: 3,
            max_infra_retries: 3,
            lease_owner: "rlm-core".to_string(),
            lease_ttl_seconds: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"inline_state_cutoff": 100}"#).unwrap();
        assert_eq!(config.inline_state_cutoff, 100);
        assert_eq!(config.tool_resolution_max_concurrency, 4);
    }
}
