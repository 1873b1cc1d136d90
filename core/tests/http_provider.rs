#![expect(clippy::unwrap_used)]

//! HTTP LLM provider against a mock server: happy path plus error
//! classification.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::method;
use wiremock::matchers::path;

use rlm_core::CancelSignal;
use rlm_core::providers::HttpLlmProvider;
use rlm_core::providers::LlmCall;
use rlm_core::providers::LlmProvider;
use rlm_core::providers::ProviderErr;

fn call() -> LlmCall {
    LlmCall {
        model: "sub-model".to_string(),
        prompt: "echo back: Hello".to_string(),
        max_tokens: Some(64),
        temperature: 0.0,
    }
}

#[tokio::test]
async fn successful_completion_parses_text_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .and(body_partial_json(json!({
            "model": "sub-model",
            "prompt": "echo back: Hello",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Hello",
            "usage": {"prompt_tokens": 5, "completion_tokens": 1},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpLlmProvider::new("http", server.uri(), None);
    let cancel = CancelSignal::new();
    let response = provider
        .call(&call(), Duration::from_secs(5), &cancel)
        .await
        .unwrap();
    assert_eq!(response.text, "Hello");
    assert_eq!(response.usage.prompt_tokens, 5);
    assert_eq!(response.usage.completion_tokens, 1);
}

#[tokio::test]
async fn throttle_and_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let provider = HttpLlmProvider::new("http", server.uri(), None);
    let cancel = CancelSignal::new();
    let err = provider
        .call(&call(), Duration::from_secs(5), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderErr::Transient(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn client_errors_are_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let provider = HttpLlmProvider::new("http", server.uri(), None);
    let cancel = CancelSignal::new();
    let err = provider
        .call(&call(), Duration::from_secs(5), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderErr::Permanent(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn cancelled_signal_short_circuits_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(30))
                .set_body_json(json!({"text": "late"})),
        )
        .mount(&server)
        .await;

    let provider = HttpLlmProvider::new("http", server.uri(), None);
    let cancel = CancelSignal::new();
    let pending = provider.call(&call(), Duration::from_secs(60), &cancel);
    cancel.cancel();
    let err = pending.await.unwrap_err();
    assert!(matches!(err, ProviderErr::Cancelled));
}
