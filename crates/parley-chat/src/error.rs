//! Error taxonomy for chat exchanges.
//!
//! Cancellation is not an error: a stopped exchange ends with
//! [`ExchangeOutcome::Aborted`](crate::ExchangeOutcome), never an error.

/// Generic message used when a failed response carries no body text.
pub const FETCH_FAILED_MESSAGE: &str = "Failed to fetch the chat response.";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    /// Non-2xx status (`status` is set) or a network failure before any
    /// response arrived (`status` is `None`).
    #[error("{message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("The response body is empty.")]
    EmptyStream,

    /// Error record sent by the server inside the stream.
    #[error("{0}")]
    Stream(String),

    /// A client-side tool handler rejected.
    #[error("tool `{tool_call_id}` failed: {message}")]
    ToolExecution {
        tool_call_id: String,
        message: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ChatError {
    pub(crate) fn network(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub(crate) fn http(status: u16, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            FETCH_FAILED_MESSAGE.to_string()
        } else {
            body.to_string()
        };
        Self::Transport {
            status: Some(status),
            message,
        }
    }

    /// HTTP status for transport errors that got as far as a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

/// A single undecodable stream record. Logged and skipped; the rest of the
/// stream is still processed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("line has no tag separator: {line:?}")]
    MissingSeparator { line: String },

    #[error("unknown stream tag {tag:?}")]
    UnknownTag { tag: String },

    #[error("invalid payload for tag {tag:?}: {message}")]
    InvalidPayload { tag: String, message: String },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("stream ended inside an unterminated line ({len} bytes dropped)")]
    TruncatedLine { len: usize },
}
