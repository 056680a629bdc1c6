//! Retry behavior of the streaming client against a mock server.

use futures::StreamExt;
use quill_core::ModelClient;
use quill_core::Prompt;
use quill_core::QuillErr;
use quill_core::ResponseEvent;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn sse_body(events: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for event in events {
        let kind = event["type"].as_str().expect("event type");
        body.push_str(&format!("event: {kind}\ndata: {event}\n\n"));
    }
    body
}

fn completed_only_body(response_id: &str) -> String {
    sse_body(&[json!({
        "type": "response.completed",
        "response": { "id": response_id, "output": [] }
    })])
}

fn rate_limited() -> ResponseTemplate {
    ResponseTemplate::new(429).set_body_json(json!({
        "error": {
            "type": "rate_limit_exceeded",
            "code": "rate_limit_exceeded",
            "message": "Rate limit reached. Please try again in 5ms."
        }
    }))
}

async fn drain(client: &ModelClient) -> Result<Vec<ResponseEvent>, QuillErr> {
    let mut stream = client.stream(&Prompt::default()).await?;
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event?);
    }
    Ok(events)
}

#[tokio::test]
async fn rate_limits_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(rate_limited())
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(completed_only_body("resp_ok"), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = ModelClient::with_provider("test-model", server.uri(), None);
    let events = drain(&client).await.expect("stream should open after retries");

    assert!(matches!(
        events.last(),
        Some(ResponseEvent::Completed { response_id, .. }) if response_id == "resp_ok"
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn rate_limit_exhaustion_is_a_terminal_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(rate_limited())
        .mount(&server)
        .await;

    let client = ModelClient::with_provider("test-model", server.uri(), None);
    let err = drain(&client).await.expect_err("retries must exhaust");

    assert!(matches!(err, QuillErr::RateLimit { .. }), "{err:?}");
    // Exactly five attempts: the first plus four retries.
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("x-request-id", "req_123")
                .set_body_json(json!({
                    "error": {
                        "type": "invalid_request_error",
                        "message": "Unknown parameter: 'frobnicate'."
                    }
                })),
        )
        .mount(&server)
        .await;

    let client = ModelClient::with_provider("test-model", server.uri(), None);
    let err = drain(&client).await.expect_err("400 must be fatal");

    match err {
        QuillErr::UnexpectedStatus {
            status, request_id, ..
        } => {
            assert_eq!(status.as_u16(), 400);
            assert_eq!(request_id.as_deref(), Some("req_123"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn model_not_found_is_reported_as_such() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "code": "model_not_found",
                "message": "The model `nope` does not exist."
            }
        })))
        .mount(&server)
        .await;

    let client = ModelClient::with_provider("nope", server.uri(), None);
    let err = drain(&client).await.expect_err("404 must be fatal");
    assert!(matches!(err, QuillErr::ModelNotFound(_)), "{err:?}");
}

#[tokio::test]
async fn context_window_overflow_is_detected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "message": "max_tokens is too large: 200000."
            }
        })))
        .mount(&server)
        .await;

    let client = ModelClient::with_provider("test-model", server.uri(), None);
    let err = drain(&client).await.expect_err("overflow must be fatal");
    assert!(matches!(err, QuillErr::ContextWindowExceeded), "{err:?}");
}
