//! Deterministic in-process providers used by the test suite and local
//! dry runs.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::LlmCall;
use super::LlmProvider;
use super::LlmResponse;
use super::LlmUsage;
use super::ProviderErr;
use super::SearchProvider;
use crate::budget::CancelSignal;
use rlm_protocol::SearchHit;

/// Scripted LLM provider: exact-prompt mappings take priority, then a FIFO
/// queue of canned responses. Every accepted call is recorded so tests can
/// assert on call counts (e.g. cache-hit behavior).
#[derive(Default)]
pub struct ScriptedLlmProvider {
    queue: Mutex<VecDeque<String>>,
    by_prompt: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<LlmCall>>,
}

impl ScriptedLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue the next scripted response, served in order.
    pub fn push_response(&self, text: impl Into<String>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(text.into());
    }

    /// Map an exact prompt to a fixed response.
    pub fn map_prompt(&self, prompt: impl Into<String>, text: impl Into<String>) {
        self.by_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(prompt.into(), text.into());
    }

    pub fn calls(&self) -> Vec<LlmCall> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlmProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn call(
        &self,
        call: &LlmCall,
        _deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<LlmResponse, ProviderErr> {
        if cancel.is_cancelled() {
            return Err(ProviderErr::Cancelled);
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.clone());

        let mapped = self
            .by_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&call.prompt)
            .cloned();
        let text = match mapped {
            Some(text) => text,
            None => self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .ok_or_else(|| ProviderErr::Permanent("script exhausted".to_string()))?,
        };
        Ok(LlmResponse {
            text,
            usage: LlmUsage::default(),
            raw: None,
        })
    }
}

/// Scripted search provider returning fixed hits for any query.
#[derive(Default)]
pub struct ScriptedSearchProvider {
    hits: Mutex<Vec<SearchHit>>,
}

impl ScriptedSearchProvider {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits: Mutex::new(hits),
        }
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearchProvider {
    fn id(&self) -> &str {
        "scripted-search"
    }

    async fn query(
        &self,
        _query: &str,
        k: usize,
        _filters: Option<&Value>,
        _deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<Vec<SearchHit>, ProviderErr> {
        if cancel.is_cancelled() {
            return Err(ProviderErr::Cancelled);
        }
        let hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        Ok(hits.iter().take(k).cloned().collect())
    }
}
