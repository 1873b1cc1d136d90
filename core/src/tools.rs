//! Out-of-sandbox resolution of queued tool requests: caching, bounded
//! concurrency, retry, and status injection into orchestrator-owned state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::warn;

use rlm_protocol::LlmRequest;
use rlm_protocol::SearchRequest;
use rlm_protocol::ToolRequests;
use rlm_protocol::ToolStatus;

use crate::budget::CancelSignal;
use crate::error::truncate_error_text;
use crate::providers::LlmCall;
use crate::providers::LlmProvider;
use crate::providers::SearchProvider;
use crate::providers::call_with_retries;
use crate::storage::ObjectStore;
use crate::storage::cache_llm_key;
use crate::storage::cache_search_key;
use crate::util::sha256_prefixed;

const ERROR_PAYLOAD_MAX_CHARS: usize = 512;

/// Subcalls default to temperature 0 so the content-addressed cache stays
/// meaningful.
const DEFAULT_SUBCALL_TEMPERATURE: f64 = 0.0;

/// Per-turn budget snapshot the resolver enforces. Over-quota requests are
/// marked `error` individually; the execution keeps running.
#[derive(Debug, Clone, Copy)]
pub struct ResolveBudget {
    pub remaining_subcalls: u32,
    pub remaining_prompt_chars: usize,
    pub max_prompt_chars_per_request: usize,
    pub per_call_deadline: Duration,
}

/// Models configuration for a resolution round.
#[derive(Debug, Clone)]
pub struct ModelsConfig {
    pub default_model: String,
}

/// What one round of resolution produced, ready to graft into state.
#[derive(Debug, Default)]
pub struct ResolutionReport {
    pub llm_results: BTreeMap<String, Value>,
    pub search_results: BTreeMap<String, Value>,
    pub statuses: BTreeMap<String, ToolStatus>,
    pub subcalls_used: u32,
    pub prompt_chars_used: usize,
    pub cache_hits: u32,
}

pub struct ToolResolver {
    llm: Arc<dyn LlmProvider>,
    search: Option<Arc<dyn SearchProvider>>,
    store: Arc<dyn ObjectStore>,
    tenant: String,
    max_concurrency: usize,
    max_retries: u32,
}

impl ToolResolver {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        search: Option<Arc<dyn SearchProvider>>,
        store: Arc<dyn ObjectStore>,
        tenant: String,
        max_concurrency: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            llm,
            search,
            store,
            tenant,
            max_concurrency: max_concurrency.max(1),
            max_retries,
        }
    }

    pub async fn resolve(
        &self,
        requests: &ToolRequests,
        models: &ModelsConfig,
        budget: ResolveBudget,
        cancel: &CancelSignal,
    ) -> ResolutionReport {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        // Validate against remaining totals up front; rejected requests are
        // marked without ever reaching a provider.
        let mut admitted_llm = Vec::new();
        let mut report = ResolutionReport::default();
        let mut subcalls_left = budget.remaining_subcalls;
        let mut prompt_chars_left = budget.remaining_prompt_chars;
        for request in &requests.llm {
            let prompt_chars = request.prompt.chars().count();
            if subcalls_left == 0 {
                report.mark_error(&request.key, "llm", "subcall budget exhausted");
                continue;
            }
            if prompt_chars > budget.max_prompt_chars_per_request {
                report.mark_error(
                    &request.key,
                    "llm",
                    &format!(
                        "prompt of {prompt_chars} chars exceeds per-request cap of {}",
                        budget.max_prompt_chars_per_request
                    ),
                );
                continue;
            }
            if prompt_chars > prompt_chars_left {
                report.mark_error(&request.key, "llm", "execution prompt-char budget exhausted");
                continue;
            }
            subcalls_left -= 1;
            prompt_chars_left -= prompt_chars;
            report.subcalls_used += 1;
            report.prompt_chars_used += prompt_chars;
            admitted_llm.push(request.clone());
        }

        let llm_futures = admitted_llm.iter().map(|request| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                let outcome = self
                    .resolve_llm(request, models, budget.per_call_deadline, cancel)
                    .await;
                (request.key.clone(), outcome)
            }
        });
        for (key, outcome) in join_all(llm_futures).await {
            match outcome {
                Ok((value, cached)) => {
                    if cached {
                        report.cache_hits += 1;
                    }
                    report.llm_results.insert(key.clone(), value);
                    report.statuses.insert(key, ToolStatus::Resolved);
                }
                Err(message) => report.mark_error(&key, "llm", &message),
            }
        }

        let search_futures = requests.search.iter().map(|request| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                let outcome = self
                    .resolve_search(request, budget.per_call_deadline, cancel)
                    .await;
                (request.key.clone(), outcome)
            }
        });
        for (key, outcome) in join_all(search_futures).await {
            match outcome {
                Ok((value, cached)) => {
                    if cached {
                        report.cache_hits += 1;
                    }
                    report.search_results.insert(key.clone(), value);
                    report.statuses.insert(key, ToolStatus::Resolved);
                }
                Err(message) => report.mark_error(&key, "search", &message),
            }
        }

        report
    }

    async fn resolve_llm(
        &self,
        request: &LlmRequest,
        models: &ModelsConfig,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<(Value, bool), String> {
        let model = request
            .model_hint
            .clone()
            .unwrap_or_else(|| models.default_model.clone());
        let temperature = request.temperature.unwrap_or(DEFAULT_SUBCALL_TEMPERATURE);
        let call = LlmCall {
            model: model.clone(),
            prompt: request.prompt.clone(),
            max_tokens: request.max_tokens,
            temperature,
        };

        let cache_hash = llm_cache_hash(
            self.llm.id(),
            &model,
            temperature,
            request.max_tokens,
            &request.prompt,
        );
        let cache_key = cache_llm_key(&self.tenant, &cache_hash);
        if let Some(cached) = self.cache_get(&cache_key).await {
            debug!(key = request.key, "llm cache hit");
            return Ok((cached, true));
        }

        let response = call_with_retries(&self.llm, &call, deadline, cancel, self.max_retries)
            .await
            .map_err(|e| e.to_string())?;
        let value = json!({
            "text": response.text,
            "model": model,
            "usage": response.usage,
        });
        self.cache_put(&cache_key, &value).await;
        Ok((value, false))
    }

    async fn resolve_search(
        &self,
        request: &SearchRequest,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<(Value, bool), String> {
        let Some(search) = &self.search else {
            return Err("no search backend configured".to_string());
        };

        let cache_hash = search_cache_hash(search.id(), &request.query, request.k, &request.filters);
        let cache_key = cache_search_key(&self.tenant, &cache_hash);
        if let Some(cached) = self.cache_get(&cache_key).await {
            return Ok((cached, true));
        }

        let mut attempt: u64 = 0;
        let hits = loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err("call cancelled".to_string());
            }
            match search
                .query(
                    &request.query,
                    request.k,
                    request.filters.as_ref(),
                    deadline,
                    cancel,
                )
                .await
            {
                Ok(hits) => break hits,
                Err(e) if e.is_retryable() && attempt <= u64::from(self.max_retries) => {
                    warn!(attempt, error = %e, "retrying search call");
                    tokio::time::sleep(crate::util::backoff(attempt)).await;
                }
                Err(e) => return Err(e.to_string()),
            }
        };

        let value = json!({ "hits": hits });
        self.cache_put(&cache_key, &value).await;
        Ok((value, false))
    }

    async fn cache_get(&self, key: &str) -> Option<Value> {
        let bytes = self.store.get(key, None).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn cache_put(&self, key: &str, value: &Value) {
        // Entries are content-addressed and immutable; last-writer-wins is
        // safe. A failed write only costs a future cache miss.
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(key, bytes, "application/json").await {
                    warn!(key, "cache write failed: {e}");
                }
            }
            Err(e) => warn!(key, "cache serialize failed: {e}"),
        }
    }
}

impl ResolutionReport {
    fn mark_error(&mut self, key: &str, kind: &str, message: &str) {
        let payload = json!({"error": truncate_error_text(message, ERROR_PAYLOAD_MAX_CHARS)});
        match kind {
            "llm" => {
                self.llm_results.insert(key.to_string(), payload);
            }
            _ => {
                self.search_results.insert(key.to_string(), payload);
            }
        }
        self.statuses.insert(key.to_string(), ToolStatus::Error);
    }

    /// Graft results and statuses into the orchestrator-owned state keys.
    /// The merge is atomic from the sandbox's point of view: the next step
    /// sees either the pre-turn or the post-merge state.
    pub fn merge_into_state(&self, state: &mut Value) {
        let Value::Object(map) = state else { return };

        let tool_results = map
            .entry(rlm_protocol::TOOL_RESULTS_KEY)
            .or_insert_with(|| json!({"llm": {}, "search": {}}));
        if let Value::Object(results) = tool_results {
            let llm = results
                .entry("llm")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(llm) = llm {
                for (key, value) in &self.llm_results {
                    llm.insert(key.clone(), value.clone());
                }
            }
            let search = results
                .entry("search")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(search) = search {
                for (key, value) in &self.search_results {
                    search.insert(key.clone(), value.clone());
                }
            }
        }

        let status = map
            .entry(rlm_protocol::TOOL_STATUS_KEY)
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(status) = status {
            for (key, value) in &self.statuses {
                let rendered = match value {
                    ToolStatus::Pending => "pending",
                    ToolStatus::Resolved => "resolved",
                    ToolStatus::Error => "error",
                };
                status.insert(key.clone(), Value::String(rendered.to_string()));
            }
        }
    }
}

/// Drop every cache entry under a tenant's prefix. Entries are immutable, so
/// this is purely a lifecycle operation.
pub async fn purge_tenant_cache(
    store: &dyn ObjectStore,
    tenant: &str,
) -> crate::error::Result<usize> {
    let prefix = crate::storage::cache_prefix(tenant);
    let mut deleted = 0usize;
    let mut cursor = None;
    loop {
        let page = store.list(&prefix, cursor).await?;
        for key in &page.keys {
            store.delete(key).await?;
            deleted += 1;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(deleted)
}

fn llm_cache_hash(
    provider: &str,
    model: &str,
    temperature: f64,
    max_tokens: Option<u32>,
    prompt: &str,
) -> String {
    let canonical = json!([provider, model, temperature, max_tokens, prompt]);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    sha256_prefixed(&bytes)
        .trim_start_matches("sha256:")
        .to_string()
}

fn search_cache_hash(provider: &str, query: &str, k: usize, filters: &Option<Value>) -> String {
    let canonical = json!([provider, query, k, filters]);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    sha256_prefixed(&bytes)
        .trim_start_matches("sha256:")
        .to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::providers::ScriptedLlmProvider;
    use crate::storage::MemObjectStore;
    use pretty_assertions::assert_eq;

    fn requests(keys: &[&str]) -> ToolRequests {
        ToolRequests {
            llm: keys
                .iter()
                .map(|k| LlmRequest {
                    key: k.to_string(),
                    prompt: format!("prompt for {k}"),
                    model_hint: None,
                    max_tokens: None,
                    temperature: None,
                    metadata: None,
                })
                .collect(),
            search: Vec::new(),
        }
    }

    fn budget() -> ResolveBudget {
        ResolveBudget {
            remaining_subcalls: 10,
            remaining_prompt_chars: 100_000,
            max_prompt_chars_per_request: 10_000,
            per_call_deadline: Duration::from_secs(5),
        }
    }

    fn resolver(provider: Arc<ScriptedLlmProvider>) -> ToolResolver {
        ToolResolver::new(
            provider,
            None,
            Arc::new(MemObjectStore::new()),
            "t".to_string(),
            4,
            1,
        )
    }

    #[tokio::test]
    async fn resolves_and_caches_identical_requests() {
        let provider = Arc::new(ScriptedLlmProvider::new());
        provider.map_prompt("prompt for k", "Hello");
        let resolver = resolver(provider.clone());
        let models = ModelsConfig {
            default_model: "sub-model".to_string(),
        };
        let cancel = CancelSignal::new();

        let first = resolver
            .resolve(&requests(&["k"]), &models, budget(), &cancel)
            .await;
        assert_eq!(first.statuses["k"], ToolStatus::Resolved);
        assert_eq!(first.llm_results["k"]["text"], "Hello");
        assert_eq!(first.cache_hits, 0);

        // Identical tuple: served from cache, provider not called again.
        let second = resolver
            .resolve(&requests(&["k"]), &models, budget(), &cancel)
            .await;
        assert_eq!(second.cache_hits, 1);
        assert_eq!(second.llm_results["k"]["text"], "Hello");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn over_quota_requests_are_marked_error_without_aborting() {
        let provider = Arc::new(ScriptedLlmProvider::new());
        provider.map_prompt("prompt for a", "A");
        let resolver = resolver(provider.clone());
        let models = ModelsConfig {
            default_model: "sub-model".to_string(),
        };
        let mut budget = budget();
        budget.remaining_subcalls = 1;
        let cancel = CancelSignal::new();

        let report = resolver
            .resolve(&requests(&["a", "b"]), &models, budget, &cancel)
            .await;
        assert_eq!(report.statuses["a"], ToolStatus::Resolved);
        assert_eq!(report.statuses["b"], ToolStatus::Error);
        assert_eq!(report.subcalls_used, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn provider_failure_is_truncated_into_state() {
        let provider = Arc::new(ScriptedLlmProvider::new());
        // No scripted response: every call fails permanently.
        let resolver = resolver(provider);
        let models = ModelsConfig {
            default_model: "sub-model".to_string(),
        };
        let cancel = CancelSignal::new();

        let report = resolver
            .resolve(&requests(&["k"]), &models, budget(), &cancel)
            .await;
        assert_eq!(report.statuses["k"], ToolStatus::Error);
        assert!(
            report.llm_results["k"]["error"]
                .as_str()
                .unwrap()
                .contains("script exhausted")
        );
    }

    #[tokio::test]
    async fn merge_into_state_is_additive_across_turns() {
        let mut state = json!({
            "_tool_results": {"llm": {"old": {"text": "kept"}}, "search": {}},
            "_tool_status": {"old": "resolved"},
            "work": {},
        });
        let mut report = ResolutionReport::default();
        report.llm_results.insert("new".to_string(), json!({"text": "fresh"}));
        report.statuses.insert("new".to_string(), ToolStatus::Resolved);
        report.merge_into_state(&mut state);

        assert_eq!(state["_tool_results"]["llm"]["old"]["text"], "kept");
        assert_eq!(state["_tool_results"]["llm"]["new"]["text"], "fresh");
        assert_eq!(state["_tool_status"]["new"], "resolved");
        // Re-using a key replaces its entry and status.
        let mut replay = ResolutionReport::default();
        replay.llm_results.insert("old".to_string(), json!({"text": "replaced"}));
        replay.statuses.insert("old".to_string(), ToolStatus::Error);
        replay.merge_into_state(&mut state);
        assert_eq!(state["_tool_results"]["llm"]["old"]["text"], "replaced");
        assert_eq!(state["_tool_status"]["old"], "error");
    }

    #[tokio::test]
    async fn purge_removes_only_the_tenant_prefix() {
        use crate::storage::ObjectStore as _;
        let store = MemObjectStore::new();
        store
            .put("cache/t/llm/h1", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        store
            .put("cache/t/search/h2", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        store
            .put("cache/other/llm/h3", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        let deleted = purge_tenant_cache(&store, "t").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get("cache/other/llm/h3", None).await.is_ok());
    }

    #[test]
    fn cache_hash_is_sensitive_to_each_component() {
        let base = llm_cache_hash("p", "m", 0.0, None, "prompt");
        assert_ne!(base, llm_cache_hash("p2", "m", 0.0, None, "prompt"));
        assert_ne!(base, llm_cache_hash("p", "m2", 0.0, None, "prompt"));
        assert_ne!(base, llm_cache_hash("p", "m", 0.5, None, "prompt"));
        assert_ne!(base, llm_cache_hash("p", "m", 0.0, Some(10), "prompt"));
        assert_ne!(base, llm_cache_hash("p", "m", 0.0, None, "other"));
        assert_eq!(base, llm_cache_hash("p", "m", 0.0, None, "prompt"));
    }
}
