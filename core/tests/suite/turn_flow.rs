//! End-to-end turn behavior: tool calls answered on the next request, the
//! pending-abort ledger settled across runs.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use quill_core::AgentConfig;
use quill_core::AgentLoop;
use quill_core::ModelClient;
use quill_core::SessionHooks;
use quill_protocol::ApprovalPolicy;
use quill_protocol::CommandConfirmation;
use quill_protocol::ContentItem;
use quill_protocol::ResponseItem;
use quill_protocol::ReviewDecision;
use serde_json::Value;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

#[derive(Default)]
struct Recorder {
    items: Mutex<Vec<ResponseItem>>,
    loading: Mutex<Vec<bool>>,
    response_ids: Mutex<Vec<String>>,
    decisions: Mutex<Vec<ReviewDecision>>,
}

impl Recorder {
    fn with_decisions(decisions: Vec<ReviewDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionHooks for Recorder {
    fn on_item(&self, item: ResponseItem) {
        self.items.lock().unwrap().push(item);
    }

    fn on_loading(&self, loading: bool) {
        self.loading.lock().unwrap().push(loading);
    }

    fn on_last_response_id(&self, response_id: &str) {
        self.response_ids.lock().unwrap().push(response_id.to_string());
    }

    async fn get_command_confirmation(
        &self,
        _command: Vec<String>,
        _patch: Option<String>,
        _explanation: Option<String>,
    ) -> CommandConfirmation {
        let mut decisions = self.decisions.lock().unwrap();
        let decision = if decisions.is_empty() {
            ReviewDecision::Denied
        } else {
            decisions.remove(0)
        };
        CommandConfirmation {
            decision,
            custom_deny_message: None,
        }
    }

    async fn get_explanation(&self, _command: Vec<String>) -> String {
        "explanation".to_string()
    }
}

fn sse(events: &[Value]) -> String {
    let mut body = String::new();
    for event in events {
        let kind = event["type"].as_str().expect("event type");
        body.push_str(&format!("event: {kind}\ndata: {event}\n\n"));
    }
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_raw(body, "text/event-stream")
}

fn shell_call_turn(response_id: &str, call_id: &str, command: &[&str]) -> String {
    let arguments = serde_json::to_string(&json!({ "command": command })).unwrap();
    let call = json!({
        "type": "function_call",
        "name": "shell",
        "arguments": arguments,
        "call_id": call_id,
    });
    sse(&[
        json!({"type": "response.created", "response": {}}),
        json!({"type": "response.output_item.done", "item": call}),
        json!({
            "type": "response.completed",
            "response": { "id": response_id, "output": [call] }
        }),
    ])
}

fn message_turn(response_id: &str, text: &str) -> String {
    let message = json!({
        "type": "message",
        "role": "assistant",
        "content": [{"type": "output_text", "text": text}],
    });
    sse(&[
        json!({"type": "response.output_item.done", "item": message}),
        json!({
            "type": "response.completed",
            "response": { "id": response_id, "output": [message] }
        }),
    ])
}

fn user_input(text: &str) -> Vec<ResponseItem> {
    vec![ResponseItem::Message {
        role: "user".to_string(),
        content: vec![ContentItem::InputText {
            text: text.to_string(),
        }],
    }]
}

fn request_input(request: &Request) -> Vec<Value> {
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    body["input"].as_array().cloned().unwrap_or_default()
}

async fn agent_against(server: &MockServer, policy: ApprovalPolicy, hooks: Arc<Recorder>) -> AgentLoop {
    let mut config = AgentConfig::new("test-model", policy);
    config.cwd = std::env::temp_dir();
    let client = ModelClient::with_provider("test-model", server.uri(), None);
    AgentLoop::with_client(config, hooks, client)
}

#[cfg(unix)]
#[tokio::test]
async fn tool_call_output_leads_the_next_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(sse_response(shell_call_turn(
            "resp_1",
            "call_1",
            &["echo", "hello"],
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(sse_response(message_turn("resp_2", "all done")))
        .mount(&server)
        .await;

    let hooks = Arc::new(Recorder::default());
    let agent = agent_against(&server, ApprovalPolicy::Suggest, Arc::clone(&hooks)).await;

    agent.run(user_input("run echo for me"), None).await.unwrap();

    // Both responses were chained and reported, in order.
    assert_eq!(
        *hooks.response_ids.lock().unwrap(),
        vec!["resp_1".to_string(), "resp_2".to_string()]
    );
    assert_eq!(*hooks.loading.lock().unwrap(), vec![true, false]);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    // The second request chains from the first and leads with the answer to
    // the call id.
    let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(body["previous_response_id"], "resp_1");
    let input = request_input(&requests[1]);
    assert_eq!(input[0]["type"], "function_call_output");
    assert_eq!(input[0]["call_id"], "call_1");
    let output: Value = serde_json::from_str(input[0]["output"].as_str().unwrap()).unwrap();
    assert_eq!(output["output"], "hello\n");
    assert_eq!(output["metadata"]["exit_code"], 0);

    // The UI saw the final assistant message.
    let items = hooks.items.lock().unwrap();
    assert!(items.iter().any(|item| matches!(
        item,
        ResponseItem::Message { role, content }
            if role == "assistant"
                && content.iter().any(|c| matches!(
                    c,
                    ContentItem::OutputText { text } if text == "all done"
                ))
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn aborted_calls_are_settled_on_the_next_run() {
    let server = MockServer::start().await;
    // Run 1: the model asks for a command the user refuses with Abort.
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(sse_response(shell_call_turn(
            "resp_1",
            "call_aborted",
            &["touch", "/tmp/should-not-exist"],
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // Run 2: a plain message turn.
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(sse_response(message_turn("resp_2", "hello again")))
        .mount(&server)
        .await;

    let hooks = Arc::new(Recorder::with_decisions(vec![ReviewDecision::Abort]));
    let agent = agent_against(&server, ApprovalPolicy::Suggest, Arc::clone(&hooks)).await;

    // First run ends silently on the abort decision.
    agent.run(user_input("do something risky"), None).await.unwrap();
    assert_eq!(*hooks.loading.lock().unwrap(), vec![true, false]);

    // The next run must settle the dangling call id before anything else.
    agent.run(user_input("never mind"), None).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let input = request_input(&requests[1]);
    assert_eq!(input[0]["type"], "function_call_output");
    assert_eq!(input[0]["call_id"], "call_aborted");
    assert_eq!(
        input[0]["output"],
        r#"{"metadata":{"duration_seconds":0,"exit_code":1},"output":"aborted"}"#
    );
    // The user's message follows the synthetic answers.
    assert_eq!(input[1]["type"], "message");
}

#[cfg(unix)]
#[tokio::test]
async fn denied_commands_report_and_the_turn_continues() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(sse_response(shell_call_turn(
            "resp_1",
            "call_1",
            &["rm", "-rf", "/tmp/precious"],
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(sse_response(message_turn("resp_2", "understood")))
        .mount(&server)
        .await;

    let hooks = Arc::new(Recorder::with_decisions(vec![ReviewDecision::Denied]));
    let agent = agent_against(&server, ApprovalPolicy::Suggest, Arc::clone(&hooks)).await;
    agent.run(user_input("clean up"), None).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let input = request_input(&requests[1]);
    let output: Value = serde_json::from_str(input[0]["output"].as_str().unwrap()).unwrap();
    assert_eq!(output["output"], "command rejected by user");
    assert_eq!(output["metadata"]["exit_code"], 1);
}

#[tokio::test]
async fn retry_exhaustion_emits_exactly_one_system_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "message": "Unknown parameter."
            }
        })))
        .mount(&server)
        .await;

    let hooks = Arc::new(Recorder::default());
    let agent = agent_against(&server, ApprovalPolicy::Suggest, Arc::clone(&hooks)).await;
    agent.run(user_input("hi"), None).await.unwrap();

    let items = hooks.items.lock().unwrap();
    let system_messages: Vec<_> = items
        .iter()
        .filter(|item| matches!(item, ResponseItem::Message { role, .. } if role == "system"))
        .collect();
    assert_eq!(system_messages.len(), 1);
    assert_eq!(*hooks.loading.lock().unwrap(), vec![true, false]);
}
