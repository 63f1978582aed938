//! Session behavior: endpoint, stream protocol, and tool-step limits.

use serde::{Deserialize, Serialize};

/// How a response body is framed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Newline-delimited `<tag>:<json>` records.
    #[default]
    Structured,
    /// Every chunk is raw assistant text.
    Plain,
}

/// Which transcript a deferred resubmission sends when a tool result was
/// submitted while another exchange was still streaming.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeferredResubmit {
    /// Send the transcript as it stands once the in-flight exchange finished.
    #[default]
    PostCompletion,
    /// Send the transcript captured when the tool result was submitted.
    OriginSnapshot,
}

/// Credential policy handed to the network client with every request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Chat endpoint. Exchanges POST here; resume issues a GET.
    pub api: String,
    /// Fixed conversation id. A fresh one is generated when absent.
    pub id: Option<String>,
    /// Upper bound on consecutive assistant messages produced by automatic
    /// tool continuation (valid range: 1-100). `1` disables continuation.
    pub max_steps: u32,
    pub stream_mode: StreamMode,
    /// Send every message field (ids, timestamps) instead of the minimal set.
    pub send_extra_message_fields: bool,
    /// Roll the transcript back to its pre-exchange state when an exchange fails.
    pub drop_last_message_on_error: bool,
    pub deferred_resubmit: DeferredResubmit,
    pub credentials: Credentials,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api: "http://localhost:3000/api/chat".into(),
            id: None,
            max_steps: 1,
            stream_mode: StreamMode::Structured,
            send_extra_message_fields: false,
            drop_last_message_on_error: false,
            deferred_resubmit: DeferredResubmit::PostCompletion,
            credentials: Credentials::SameOrigin,
        }
    }
}
