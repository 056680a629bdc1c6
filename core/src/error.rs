use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuillErr>;

#[derive(Debug, Error)]
pub enum SandboxErr {
    #[error("sandbox was mandated, but no sandbox is available on this platform")]
    NoSandboxAvailable,

    #[error("linux sandbox helper executable is not configured")]
    MissingLinuxSandboxHelper,
}

#[derive(Debug, Error)]
pub enum QuillErr {
    /// The stream produced an error or disconnected before `response.completed`.
    /// The optional duration is a server-provided retry hint.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    /// Rate limited (HTTP 429 or a typed `rate_limit_exceeded` error) and the
    /// retry budget is exhausted.
    #[error("rate limit reached: {message}")]
    RateLimit {
        message: String,
        status: Option<StatusCode>,
    },

    /// Retry budget exhausted on transient faults.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// The conversation no longer fits the model context window.
    #[error("the request exceeds the model's context window")]
    ContextWindowExceeded,

    /// `invalid_request_error` with `code = model_not_found`.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// A 4xx other than 401/429; body and request id are surfaced verbatim.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        status: StatusCode,
        body: String,
        request_id: Option<String>,
    },

    #[error("server error: {0}")]
    InternalServerError(StatusCode),

    /// The user cancelled the run; not an error surface.
    #[error("interrupted")]
    Interrupted,

    /// `terminate()` was called; the instance accepts no further runs.
    #[error("session terminated")]
    SessionTerminated,

    #[error("missing environment variable: {0}")]
    EnvVar(&'static str),

    #[error(transparent)]
    Sandbox(#[from] SandboxErr),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

impl QuillErr {
    /// True when another attempt of the same streaming request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuillErr::Stream(..)
                | QuillErr::RateLimit { .. }
                | QuillErr::InternalServerError(_)
                | QuillErr::Reqwest(_)
        )
    }

    /// Retry delay the server asked for, when it said.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            QuillErr::Stream(_, hint) => *hint,
            _ => None,
        }
    }

    /// The single system message surfaced to the user when a run ends on this
    /// error. `None` for errors with no user surface (cancellation).
    pub fn user_message(&self) -> Option<String> {
        match self {
            QuillErr::Interrupted | QuillErr::SessionTerminated => None,
            QuillErr::ContextWindowExceeded => Some(
                "The conversation no longer fits the model's context window. \
                 Clear the history or switch to a model with a larger context."
                    .to_string(),
            ),
            QuillErr::ModelNotFound(model) => Some(format!(
                "The model `{model}` does not exist or you do not have access to it."
            )),
            QuillErr::RateLimit { message, status } => Some(match status {
                Some(status) => {
                    format!("Rate limit reached. Error details: {status}: {message}")
                }
                None => format!("Rate limit reached. Error details: {message}"),
            }),
            QuillErr::UnexpectedStatus {
                status,
                body,
                request_id,
            } => Some(match request_id {
                Some(id) => format!("Request failed with {status} (request id {id}): {body}"),
                None => format!("Request failed with {status}: {body}"),
            }),
            QuillErr::Stream(message, _) => Some(format!(
                "Connection to the model was lost and could not be re-established: {message}"
            )),
            other => Some(format!("Turn failed: {other}")),
        }
    }
}
