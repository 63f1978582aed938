//! Transcript entries and their ordered content parts.

mod part;


pub use part::{Part, Source, ToolCall, ToolInvocation, ToolInvocationState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A file or URL attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub url: String,
}

impl Attachment {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: None,
            content_type: None,
            url: url.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// One transcript entry.
///
/// An empty `id` means "not assigned yet"; the session fills it in before
/// the message is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawMessage")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            id: String::new(),
            role,
            created_at: Utc::now(),
            parts: Vec::new(),
            attachments: Vec::new(),
        }
    }

    fn with_text(role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let mut message = Self::new(role);
        if !text.is_empty() {
            message.parts.push(Part::Text { text });
        }
        message
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_text(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_text(Role::System, text)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Concatenated text parts. Kept for servers that only read `content`.
    pub fn content(&self) -> String {
        text_of(self)
    }

    /// Values carried by `Data` parts, in arrival order.
    pub fn annotations(&self) -> Vec<&Value> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Data { data } => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|part| match part {
            Part::ToolInvocation { tool_invocation } => Some(tool_invocation),
            _ => None,
        })
    }

    pub fn tool_invocation(&self, tool_call_id: &str) -> Option<&ToolInvocation> {
        self.tool_invocations()
            .find(|invocation| invocation.tool_call_id() == tool_call_id)
    }

    pub(crate) fn tool_invocation_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.parts.iter_mut().find_map(|part| match part {
            Part::ToolInvocation { tool_invocation } if tool_invocation.tool_call_id() == tool_call_id => {
                Some(tool_invocation)
            }
            _ => None,
        })
    }

    /// True when every tool invocation in the message has a result.
    /// Vacuously true for messages without tool invocations.
    pub fn tool_calls_resolved(&self) -> bool {
        self.tool_invocations()
            .all(|invocation| invocation.state() == ToolInvocationState::Result)
    }
}

/// Concatenation of the message's text parts, in order.
pub fn text_of(message: &Message) -> String {
    message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Number of tool invocation parts; bounds automatic continuation.
pub fn max_tool_step(message: &Message) -> usize {
    message.tool_invocations().count()
}

/// Deserialization shape that also accepts legacy `content`-only messages.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default)]
    id: String,
    role: Role,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        let mut parts = raw.parts;
        if parts.is_empty() {
            if let Some(text) = raw.content.filter(|text| !text.is_empty()) {
                parts.push(Part::Text { text });
            }
        }
        Self {
            id: raw.id,
            role: raw.role,
            created_at: raw.created_at,
            parts,
            attachments: raw.attachments,
        }
    }
}
