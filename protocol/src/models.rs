use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// One output (or input) item of a streamed model turn.
///
/// The Responses API returns these from `response.output_item.done` events and
/// accepts the same shapes back in the `input` array of the next request. The
/// `type` tag on the wire is snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        role: String,
        content: Vec<ContentItem>,
    },
    Reasoning {
        summary: Vec<ReasoningSummary>,
        /// Wall-clock milliseconds between turn start and the moment the item
        /// finished streaming. Engine-side bookkeeping only; never sent back.
        #[serde(default, skip_serializing)]
        duration_ms: Option<u64>,
    },
    FunctionCall {
        name: String,
        // The Responses API sends the arguments as a *string* containing JSON,
        // not as an already-parsed object. Keep it raw here; the exec handler
        // parses it.
        arguments: String,
        call_id: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: FunctionCallOutputPayload,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    InputText { text: String },
    InputImage { image_url: String },
    InputFile { filename: String },
    OutputText { text: String },
    Refusal { refusal: String },
}

/// One section of a reasoning summary.
///
/// The wire shape is `{"type": "summary_text", "text": "..."}`; some models
/// additionally attach a short headline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReasoningSummary {
    SummaryText {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headline: Option<String>,
        text: String,
    },
}

/// The `output` field of a `function_call_output` item.
///
/// On the wire this is a plain JSON string. The `success` flag is engine-side
/// metadata used by front ends to color the result; it never leaves the
/// process, which is why this type has hand-written serde impls instead of a
/// derive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionCallOutputPayload {
    pub content: String,
    pub success: Option<bool>,
}

impl Serialize for FunctionCallOutputPayload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.content)
    }
}

impl<'de> Deserialize<'de> for FunctionCallOutputPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let content = String::deserialize(deserializer)?;
        Ok(FunctionCallOutputPayload {
            content,
            success: None,
        })
    }
}

impl std::fmt::Display for FunctionCallOutputPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.content)
    }
}

/// Items the engine itself contributes to the next request's `input` array.
///
/// A narrower type than [`ResponseItem`] so call sites cannot accidentally
/// feed a streamed output item back without going through the exec handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseInputItem {
    Message {
        role: String,
        content: Vec<ContentItem>,
    },
    FunctionCallOutput {
        call_id: String,
        output: FunctionCallOutputPayload,
    },
}

impl From<ResponseInputItem> for ResponseItem {
    fn from(item: ResponseInputItem) -> Self {
        match item {
            ResponseInputItem::Message { role, content } => ResponseItem::Message { role, content },
            ResponseInputItem::FunctionCallOutput { call_id, output } => {
                ResponseItem::FunctionCallOutput { call_id, output }
            }
        }
    }
}

impl ResponseInputItem {
    pub fn from_text(role: &str, text: String) -> Self {
        ResponseInputItem::Message {
            role: role.to_string(),
            content: vec![ContentItem::InputText { text }],
        }
    }
}
