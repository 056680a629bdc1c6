use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use quill_protocol::ResponseItem;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::Result;

/// Fixed preamble prepended to every request's instructions.
const BASE_INSTRUCTIONS: &str = include_str!("../prompt.md");

/// One streaming request to the model.
#[derive(Debug, Default, Clone)]
pub struct Prompt {
    /// Conversation items for this turn (user input plus any tool outputs).
    pub input: Vec<ResponseItem>,
    /// Cursor returned by the previous `response.completed`, chaining turns.
    pub previous_response_id: Option<String>,
    /// Caller-supplied instructions appended to the base preamble.
    pub user_instructions: Option<String>,
}

impl Prompt {
    pub fn get_full_instructions(&self) -> String {
        match &self.user_instructions {
            Some(extra) if !extra.trim().is_empty() => {
                format!("{BASE_INSTRUCTIONS}\n{extra}")
            }
            _ => BASE_INSTRUCTIONS.to_string(),
        }
    }
}

/// The request body of the Responses API, as the engine uses it.
#[derive(Debug, Serialize)]
pub(crate) struct ResponsesApiRequest<'a> {
    pub model: &'a str,
    pub instructions: &'a str,
    pub input: &'a [ResponseItem],
    pub tools: &'a [Value],
    pub tool_choice: &'static str,
    pub parallel_tool_calls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<&'a str>,
    pub stream: bool,
}

/// Definition of the `shell` tool registered with the model.
pub(crate) fn create_shell_tool_json() -> Value {
    json!({
        "type": "function",
        "name": "shell",
        "description": "Runs a shell command, and returns its output.",
        "strict": false,
        "parameters": {
            "type": "object",
            "properties": {
                "command": {
                    "type": "array",
                    "items": { "type": "string" },
                },
                "workdir": { "type": "string" },
                "timeout": {
                    "type": "number",
                    "description": "The maximum time to wait for the command to complete in milliseconds.",
                },
            },
            "required": ["command"],
            "additionalProperties": false,
        },
    })
}

/// Events the SSE processor forwards to the turn engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Created,
    OutputItemDone(ResponseItem),
    Completed {
        response_id: String,
        /// The full output array from the `response.completed` envelope; the
        /// turn engine runs its fallback processor over it to catch items the
        /// incremental events missed.
        output: Vec<ResponseItem>,
    },
}

pub struct ResponseStream {
    pub(crate) rx_event: mpsc::Receiver<Result<ResponseEvent>>,
}

impl Stream for ResponseStream {
    type Item = Result<ResponseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_instructions_append_caller_text() {
        let prompt = Prompt {
            user_instructions: Some("Prefer rg over grep.".to_string()),
            ..Default::default()
        };
        let merged = prompt.get_full_instructions();
        assert!(merged.starts_with(BASE_INSTRUCTIONS));
        assert!(merged.ends_with("Prefer rg over grep."));

        let bare = Prompt::default().get_full_instructions();
        assert_eq!(bare, BASE_INSTRUCTIONS);
    }

    #[test]
    fn shell_tool_requires_command() {
        let tool = create_shell_tool_json();
        assert_eq!(tool["name"], "shell");
        assert_eq!(tool["parameters"]["required"][0], "command");
    }
}
