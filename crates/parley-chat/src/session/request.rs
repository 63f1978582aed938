//! Outgoing request construction.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::options::{RequestOptions, SessionOptions};
use crate::error::ChatError;
use crate::message::Message;
use crate::transport::{FetchRequest, Method};
use parley_common::SessionId;

/// Serialize one message for the request body. The minimal form carries only
/// what the server needs to rebuild the conversation; `extra` adds ids and
/// timestamps.
pub(crate) fn message_json(message: &Message, extra: bool) -> Value {
    let mut out = Map::new();
    if extra {
        out.insert("id".into(), json!(message.id));
        out.insert("createdAt".into(), json!(message.created_at));
    }
    out.insert("role".into(), json!(message.role));
    out.insert("content".into(), json!(message.content()));
    out.insert("parts".into(), json!(message.parts));
    if !message.attachments.is_empty() {
        out.insert("attachments".into(), json!(message.attachments));
    }
    let annotations = message.annotations();
    if !annotations.is_empty() {
        out.insert("annotations".into(), json!(annotations));
    }
    let invocations: Vec<_> = message.tool_invocations().collect();
    if !invocations.is_empty() {
        out.insert("toolInvocations".into(), json!(invocations));
    }
    Value::Object(out)
}

/// `{id, messages, data?}` followed by session body fields, then per-call
/// body fields. Later keys overwrite earlier ones.
pub(crate) fn chat_body(
    id: &SessionId,
    messages: &[Message],
    session: &SessionOptions,
    call: &RequestOptions,
) -> Value {
    let messages: Vec<Value> = messages
        .iter()
        .map(|message| message_json(message, session.send_extra_message_fields))
        .collect();

    let mut body = Map::new();
    body.insert("id".into(), json!(id));
    body.insert("messages".into(), Value::Array(messages));
    if let Some(data) = &call.data {
        body.insert("data".into(), data.clone());
    }
    for (key, value) in session.body.iter().chain(call.body.iter()) {
        body.insert(key.clone(), value.clone());
    }
    Value::Object(body)
}

/// Session headers overlaid with per-call headers. Names compare
/// case-insensitively; the per-call spelling and value win.
pub(crate) fn merge_headers(
    session: &BTreeMap<String, String>,
    call: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = session.clone();
    for (name, value) in call {
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        merged.insert(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn submit_request(
    id: &SessionId,
    messages: &[Message],
    session: &SessionOptions,
    call: &RequestOptions,
) -> Result<FetchRequest, ChatError> {
    let body = chat_body(id, messages, session, call);
    let body = serde_json::to_string(&body)
        .map_err(|e| ChatError::InvalidRequest(format!("unserializable body: {e}")))?;
    Ok(FetchRequest {
        url: session.api.clone(),
        method: Method::Post,
        headers: merge_headers(&session.headers, &call.headers),
        body: Some(body),
        credentials: session.credentials,
    })
}

/// `GET {api}?chatId={id}`.
pub(crate) fn resume_request(
    id: &SessionId,
    session: &SessionOptions,
    call: &RequestOptions,
) -> Result<FetchRequest, ChatError> {
    let mut url = reqwest::Url::parse(&session.api)
        .map_err(|e| ChatError::InvalidRequest(format!("invalid api url {:?}: {e}", session.api)))?;
    url.query_pairs_mut().append_pair("chatId", id.as_str());
    Ok(FetchRequest {
        url: url.into(),
        method: Method::Get,
        headers: merge_headers(&session.headers, &call.headers),
        body: None,
        credentials: session.credentials,
    })
}
