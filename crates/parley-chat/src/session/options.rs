use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::message::{Attachment, Message};
use parley_common::SessionId;
use parley_config::{Credentials, DeferredResubmit, ParleyConfig, StreamMode};

/// Construction-time session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub api: String,
    /// Conversation id; generated when absent.
    pub id: Option<SessionId>,
    /// Transcript the session starts with and returns to on `reset`.
    pub initial_messages: Vec<Message>,
    pub max_steps: u32,
    pub stream_mode: StreamMode,
    pub send_extra_message_fields: bool,
    pub drop_last_message_on_error: bool,
    pub deferred_resubmit: DeferredResubmit,
    pub credentials: Credentials,
    /// Default headers; per-call headers win on a case-insensitive match.
    pub headers: BTreeMap<String, String>,
    /// Extra body fields merged into every request.
    pub body: Map<String, Value>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&ParleyConfig::default())
    }
}

impl SessionOptions {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &ParleyConfig) -> Self {
        let session = &config.session;
        Self {
            api: session.api.clone(),
            id: session.id.as_deref().map(SessionId::from),
            initial_messages: Vec::new(),
            max_steps: session.max_steps,
            stream_mode: session.stream_mode,
            send_extra_message_fields: session.send_extra_message_fields,
            drop_last_message_on_error: session.drop_last_message_on_error,
            deferred_resubmit: session.deferred_resubmit,
            credentials: session.credentials,
            headers: config.request.headers.clone(),
            body: config.request.body.clone(),
        }
    }

    pub fn with_id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_initial_messages(mut self, messages: Vec<Message>) -> Self {
        self.initial_messages = messages;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    pub fn with_extra_message_fields(mut self, enabled: bool) -> Self {
        self.send_extra_message_fields = enabled;
        self
    }

    pub fn with_drop_last_message_on_error(mut self, enabled: bool) -> Self {
        self.drop_last_message_on_error = enabled;
        self
    }

    pub fn with_deferred_resubmit(mut self, policy: DeferredResubmit) -> Self {
        self.deferred_resubmit = policy;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }
}

/// Per-call additions to one request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    /// Merged into the body last, after session-level fields.
    pub body: Map<String, Value>,
    /// Sent as the body's `data` field.
    pub data: Option<Value>,
    /// Attached to the message being appended.
    pub attachments: Vec<Attachment>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}
