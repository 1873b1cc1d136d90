//! Provider interfaces for the root model, subcalls and the optional search
//! backend. The core depends only on these traits; concrete adapters are
//! selected at startup by the host.

mod http;
mod scripted;

pub use http::HttpLlmProvider;
pub use scripted::ScriptedLlmProvider;
pub use scripted::ScriptedSearchProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use rlm_protocol::SearchHit;

use crate::budget::CancelSignal;
use crate::util::backoff;

#[derive(Error, Debug, Clone)]
pub enum ProviderErr {
    /// Worth retrying: throttles, 5xx, transport hiccups.
    #[error("transient: {0}")]
    Transient(String),

    /// Not worth retrying: bad request, auth, permanent backend failures.
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("call timed out")]
    Timeout,

    #[error("call cancelled")]
    Cancelled,
}

impl ProviderErr {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderErr::Transient(_) | ProviderErr::Timeout)
    }
}

/// One LLM invocation, root call and subcall alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub model: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub usage: LlmUsage,
    /// Raw provider payload, if the adapter keeps it around.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable identifier; part of the cache key.
    fn id(&self) -> &str;

    async fn call(
        &self,
        call: &LlmCall,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<LlmResponse, ProviderErr>;
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn query(
        &self,
        query: &str,
        k: usize,
        filters: Option<&Value>,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<Vec<SearchHit>, ProviderErr>;
}

/// Bounded-retry wrapper shared by root calls and subcalls. Retries only
/// transient failures, observes the cancellation signal between attempts.
pub(crate) async fn call_with_retries(
    provider: &Arc<dyn LlmProvider>,
    call: &LlmCall,
    deadline: Duration,
    cancel: &CancelSignal,
    max_retries: u32,
) -> Result<LlmResponse, ProviderErr> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(ProviderErr::Cancelled);
        }
        match provider.call(call, deadline, cancel).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt <= u64::from(max_retries) => {
                warn!(attempt, error = %e, "retrying provider call");
                tokio::select! {
                    _ = tokio::time::sleep(backoff(attempt)) => {}
                    _ = cancel.cancelled() => return Err(ProviderErr::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn transient_and_timeout_are_retryable() {
        assert!(ProviderErr::Transient("429".to_string()).is_retryable());
        assert!(ProviderErr::Timeout.is_retryable());
        assert!(!ProviderErr::Permanent("400".to_string()).is_retryable());
        assert!(!ProviderErr::Cancelled.is_retryable());
    }
}
