//! Streaming client for the Responses API.
//!
//! One public entry point: [`ModelClient::stream`], which opens the SSE
//! request (retrying transient faults with exponential backoff) and returns a
//! channel of [`ResponseEvent`]s. The retry taxonomy is deliberately narrow:
//! connection failures, 5xx, and rate limits retry; every other 4xx is
//! surfaced immediately with the response body attached.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use quill_protocol::ResponseItem;
use regex_lite::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::ResponseStream;
use crate::client_common::ResponsesApiRequest;
use crate::client_common::create_shell_tool_json;
use crate::error::QuillErr;
use crate::error::Result;
use crate::flags;
use crate::util::backoff;

/// Maximum attempts per streaming request, the first included.
const MAX_STREAM_ATTEMPTS: u64 = 5;

/// A stream that stays completely silent for this long is treated as
/// disconnected.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    r#type: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelClient {
    http: reqwest::Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
}

impl ModelClient {
    /// Client configured from the `OPENAI_*` environment.
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_provider(
            model,
            flags::OPENAI_BASE_URL.clone(),
            flags::OPENAI_API_KEY.clone(),
        )
    }

    /// Client with an explicit endpoint, bypassing the environment. Used by
    /// tests and embedders that proxy the API.
    pub fn with_provider(
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            model: model.into(),
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Open one streamed turn. Retries transient faults internally; the
    /// returned stream yields exactly one `Completed` event on success.
    pub async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream> {
        if let Some(path) = &*flags::QUILL_SSE_FIXTURE {
            warn!(path, "streaming from fixture");
            return stream_from_fixture(path).await;
        }

        let full_instructions = prompt.get_full_instructions();
        let tools: Vec<Value> = vec![create_shell_tool_json()];
        let payload = ResponsesApiRequest {
            model: &self.model,
            instructions: &full_instructions,
            input: &prompt.input,
            tools: &tools,
            tool_choice: "auto",
            parallel_tool_calls: false,
            previous_response_id: prompt.previous_response_id.as_deref(),
            stream: true,
        };

        let url = format!("{}/responses", self.base_url);
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            trace!("POST {url} (attempt {attempt}/{MAX_STREAM_ATTEMPTS})");

            let mut builder = self
                .http
                .post(&url)
                .timeout(*flags::OPENAI_TIMEOUT)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&payload);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            match builder.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let (tx_event, rx_event) = mpsc::channel::<Result<ResponseEvent>>(1600);
                    let stream = resp.bytes_stream().map_err(QuillErr::Reqwest);
                    tokio::spawn(process_sse(stream, tx_event, STREAM_IDLE_TIMEOUT));
                    return Ok(ResponseStream { rx_event });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let request_id = resp
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = resp.text().await.unwrap_or_default();
                    let error = serde_json::from_str::<ErrorResponse>(&body)
                        .ok()
                        .map(|e| e.error);

                    if let Some(fatal) = classify_fatal(status, error.as_ref(), &body, request_id) {
                        return Err(fatal);
                    }

                    if attempt >= MAX_STREAM_ATTEMPTS {
                        if status == StatusCode::TOO_MANY_REQUESTS {
                            return Err(QuillErr::RateLimit {
                                message: error
                                    .and_then(|e| e.message)
                                    .unwrap_or_else(|| body.clone()),
                                status: Some(status),
                            });
                        }
                        if status.is_server_error() {
                            return Err(QuillErr::InternalServerError(status));
                        }
                        return Err(QuillErr::RetryLimit(status));
                    }

                    let delay = retry_after
                        .or_else(|| error.as_ref().and_then(try_parse_retry_hint))
                        .unwrap_or_else(|| backoff(attempt));
                    debug!("request failed with {status}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt >= MAX_STREAM_ATTEMPTS {
                        return Err(e.into());
                    }
                    let delay = backoff(attempt);
                    debug!("request error: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Map a non-success response to a terminal error, or `None` when it should
/// be retried.
fn classify_fatal(
    status: StatusCode,
    error: Option<&ErrorBody>,
    body: &str,
    request_id: Option<String>,
) -> Option<QuillErr> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return None;
    }

    if let Some(error) = error
        && error.r#type.as_deref() == Some("invalid_request_error")
    {
        if error.code.as_deref() == Some("model_not_found") {
            return Some(QuillErr::ModelNotFound(
                error.message.clone().unwrap_or_default(),
            ));
        }
        if error.code.as_deref() == Some("context_length_exceeded")
            || error
                .message
                .as_deref()
                .is_some_and(|m| m.to_ascii_lowercase().contains("max_tokens is too large"))
        {
            return Some(QuillErr::ContextWindowExceeded);
        }
    }

    Some(QuillErr::UnexpectedStatus {
        status,
        body: body.to_string(),
        request_id,
    })
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    response: Option<Value>,
    item: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResponseCompleted {
    id: String,
    #[serde(default)]
    output: Vec<ResponseItem>,
}

/// Translate the SSE byte stream into [`ResponseEvent`]s.
///
/// `response.output_item.done` items are forwarded as they arrive so the
/// engine can stage them live. The final `Completed` event is held back until
/// the stream actually ends: a transport that dies after `response.completed`
/// was parsed still counts as completed, while a stream that ends without one
/// surfaces as a retryable [`QuillErr::Stream`].
async fn process_sse<S>(stream: S, tx_event: mpsc::Sender<Result<ResponseEvent>>, idle: Duration)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    let mut response_completed: Option<ResponseCompleted> = None;
    let mut response_error: Option<QuillErr> = None;

    loop {
        let sse = match timeout(idle, stream.next()).await {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                debug!("SSE error: {e:#}");
                let _ = tx_event.send(Err(QuillErr::Stream(e.to_string(), None))).await;
                return;
            }
            Ok(None) => {
                match response_completed {
                    Some(ResponseCompleted { id, output }) => {
                        let _ = tx_event
                            .send(Ok(ResponseEvent::Completed {
                                response_id: id,
                                output,
                            }))
                            .await;
                    }
                    None => {
                        let _ = tx_event
                            .send(Err(response_error.unwrap_or(QuillErr::Stream(
                                "stream closed before response.completed".into(),
                                None,
                            ))))
                            .await;
                    }
                }
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(QuillErr::Stream(
                        "idle timeout waiting for SSE".into(),
                        None,
                    )))
                    .await;
                return;
            }
        };

        trace!("SSE event: {}", sse.data);
        let event: SseEvent = match serde_json::from_str(&sse.data) {
            Ok(event) => event,
            Err(e) => {
                debug!("failed to parse SSE event: {e}, data: {}", sse.data);
                continue;
            }
        };

        match event.kind.as_str() {
            "response.output_item.done" => {
                let Some(item_val) = event.item else { continue };
                let Ok(item) = serde_json::from_value::<ResponseItem>(item_val) else {
                    debug!("failed to parse ResponseItem from output_item.done");
                    continue;
                };
                if tx_event.send(Ok(ResponseEvent::OutputItemDone(item))).await.is_err() {
                    return;
                }
            }
            "response.created" => {
                if event.response.is_some()
                    && tx_event.send(Ok(ResponseEvent::Created)).await.is_err()
                {
                    return;
                }
            }
            "response.failed" => {
                if let Some(resp_val) = event.response {
                    response_error = Some(QuillErr::Stream(
                        "response.failed event received".to_string(),
                        None,
                    ));
                    if let Some(error_val) = resp_val.get("error")
                        && let Ok(error) = serde_json::from_value::<ErrorBody>(error_val.clone())
                    {
                        let hint = try_parse_retry_hint(&error);
                        let message = error.message.unwrap_or_default();
                        response_error = Some(QuillErr::Stream(message, hint));
                    }
                }
            }
            "response.completed" => {
                if let Some(resp_val) = event.response {
                    match serde_json::from_value::<ResponseCompleted>(resp_val) {
                        Ok(completed) => response_completed = Some(completed),
                        Err(e) => debug!("failed to parse response.completed: {e}"),
                    }
                }
            }
            _ => {}
        }
    }
}

fn retry_hint_regex() -> &'static Regex {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)(s|ms)").unwrap()
    });
    &RE
}

/// Extract the "Please try again in 1.3s" hint carried by rate-limit errors.
fn try_parse_retry_hint(err: &ErrorBody) -> Option<Duration> {
    let typed_rate_limit = err.code.as_deref() == Some("rate_limit_exceeded")
        || err.r#type.as_deref() == Some("rate_limit_exceeded");
    if !typed_rate_limit {
        return None;
    }
    let message = err.message.as_deref()?;
    let captures = retry_hint_regex().captures(message)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    match captures.get(2)?.as_str() {
        "ms" => Some(Duration::from_millis(value as u64)),
        _ => Some(Duration::from_secs_f64(value)),
    }
}

/// Stream from a local SSE transcript instead of the network. Test hook.
async fn stream_from_fixture(path: impl AsRef<Path>) -> Result<ResponseStream> {
    use std::io::BufRead;
    let (tx_event, rx_event) = mpsc::channel::<Result<ResponseEvent>>(1600);
    let file = std::fs::File::open(path.as_ref())?;
    let mut content = String::new();
    for line in std::io::BufReader::new(file).lines() {
        content.push_str(&line?);
        content.push_str("\n\n");
    }
    let reader = std::io::Cursor::new(content);
    let stream = tokio_util::io::ReaderStream::new(reader).map_err(QuillErr::Io);
    tokio::spawn(process_sse(stream, tx_event, STREAM_IDLE_TIMEOUT));
    Ok(ResponseStream { rx_event })
}
