use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::message::{Source, ToolCall};

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
    Unknown,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content-filter",
            Self::ToolCalls => "tool-calls",
            Self::Error => "error",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

impl From<String> for FinishReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "content-filter" => Self::ContentFilter,
            "tool-calls" => Self::ToolCalls,
            "error" => Self::Error,
            "other" => Self::Other,
            _ => Self::Unknown,
        }
    }
}

impl From<FinishReason> for &'static str {
    fn from(value: FinishReason) -> Self {
        value.as_str()
    }
}

/// Token accounting reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, deserialize_with = "token_count")]
    pub prompt_tokens: u64,
    #[serde(default, deserialize_with = "token_count")]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Servers that could not count tokens send `null` or `NaN`-ish numbers.
fn token_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|count| count.is_finite() && *count >= 0.0)
        .map(|count| count as u64)
        .unwrap_or(0))
}

/// Payload of the message-finish record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishInfo {
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFinish {
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub is_continued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStart {
    pub tool_call_id: String,
    pub tool_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDelta {
    pub tool_call_id: String,
    pub args_text_delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StepStartPayload {
    #[serde(default)]
    pub message_id: String,
}

/// One decoded wire record.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// Auxiliary values for the session's data channel.
    DataDelta(Vec<Value>),
    MessageAnnotations(Vec<Value>),
    Error(String),
    ToolCallStreamStart(ToolCallStart),
    ToolCallArgDelta(ToolCallDelta),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    StepStart { message_id: String },
    StepFinish(StepFinish),
    MessageFinish(FinishInfo),
    Source(Source),
    File(FileData),
}

impl StreamEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::TextDelta(_) => "0",
            Self::DataDelta(_) => "2",
            Self::Error(_) => "3",
            Self::MessageAnnotations(_) => "8",
            Self::ToolCall(_) => "9",
            Self::ToolResult(_) => "a",
            Self::ToolCallStreamStart(_) => "b",
            Self::ToolCallArgDelta(_) => "c",
            Self::MessageFinish(_) => "d",
            Self::StepFinish(_) => "e",
            Self::StepStart { .. } => "f",
            Self::ReasoningDelta(_) => "g",
            Self::Source(_) => "h",
            Self::File(_) => "k",
        }
    }

    /// Encode as a newline-terminated structured-mode record.
    pub fn to_line(&self) -> String {
        let payload = match self {
            Self::TextDelta(text) | Self::ReasoningDelta(text) | Self::Error(text) => json!(text),
            Self::DataDelta(values) | Self::MessageAnnotations(values) => json!(values),
            Self::ToolCallStreamStart(start) => json!({
                "toolCallId": start.tool_call_id,
                "toolName": start.tool_name,
            }),
            Self::ToolCallArgDelta(delta) => json!({
                "toolCallId": delta.tool_call_id,
                "argsTextDelta": delta.args_text_delta,
            }),
            Self::ToolCall(call) => json!({
                "toolCallId": call.tool_call_id,
                "toolName": call.tool_name,
                "args": call.args,
            }),
            Self::ToolResult(result) => json!({
                "toolCallId": result.tool_call_id,
                "result": result.result,
            }),
            Self::StepStart { message_id } => json!({ "messageId": message_id }),
            Self::StepFinish(step) => {
                let mut value = json!({
                    "finishReason": step.finish_reason.as_str(),
                    "isContinued": step.is_continued,
                });
                if let Some(usage) = step.usage {
                    value["usage"] = usage_json(usage);
                }
                value
            }
            Self::MessageFinish(info) => {
                let mut value = json!({ "finishReason": info.finish_reason.as_str() });
                if let Some(usage) = info.usage {
                    value["usage"] = usage_json(usage);
                }
                value
            }
            Self::Source(source) => {
                let mut value = json!({
                    "sourceType": source.source_type,
                    "id": source.id,
                    "url": source.url,
                });
                if let Some(title) = &source.title {
                    value["title"] = json!(title);
                }
                value
            }
            Self::File(file) => json!({ "data": file.data, "mimeType": file.mime_type }),
        };
        format!("{}:{}\n", self.tag(), payload)
    }
}

fn usage_json(usage: Usage) -> Value {
    json!({
        "promptTokens": usage.prompt_tokens,
        "completionTokens": usage.completion_tokens,
    })
}
