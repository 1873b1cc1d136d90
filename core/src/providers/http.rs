//! Reference HTTP adapter for the LLM provider contract: a JSON POST against
//! a completion endpoint, with status-classified errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::LlmCall;
use super::LlmProvider;
use super::LlmResponse;
use super::LlmUsage;
use super::ProviderErr;
use crate::budget::CancelSignal;

pub struct HttpLlmProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionPayload<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f64,
}

#[derive(Deserialize)]
struct CompletionBody {
    text: String,
    #[serde(default)]
    usage: Option<UsageBody>,
    #[serde(default)]
    raw: Option<Value>,
}

#[derive(Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl HttpLlmProvider {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn classify_status(status: StatusCode, body: String) -> ProviderErr {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProviderErr::Transient(format!("{status}: {body}"))
        } else {
            ProviderErr::Permanent(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(
        &self,
        call: &LlmCall,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<LlmResponse, ProviderErr> {
        let url = format!("{}/v1/completions", self.base_url);
        let payload = CompletionPayload {
            model: &call.model,
            prompt: &call.prompt,
            max_tokens: call.max_tokens,
            temperature: call.temperature,
        };
        debug!(url, model = call.model, "POST completion");

        let mut request = self.client.post(&url).timeout(deadline).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            result = request.send() => result,
            _ = cancel.cancelled() => return Err(ProviderErr::Cancelled),
        };
        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(ProviderErr::Timeout),
            Err(e) => return Err(ProviderErr::Transient(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| ProviderErr::Permanent(format!("malformed completion body: {e}")))?;
        Ok(LlmResponse {
            text: body.text,
            usage: body
                .usage
                .map(|u| LlmUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
            raw: body.raw,
        })
    }
}
