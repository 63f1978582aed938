//! Chat session engine for Parley.
//!
//! Turns a streamed chat-completion response into a consistent transcript:
//! - Wire decoding for structured (`<tag>:<json>` lines) and plain bodies
//! - Transcript reconciliation with tool-call lifecycles
//! - Client-side tool handlers and automatic multi-step continuation
//! - A session controller with cancellation, reload and stream resumption
//! - Token usage tracking

pub mod error;
pub mod message;
pub mod orchestrator;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod transport;
pub mod usage;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ChatError, DecodeError};
pub use message::{
    Attachment, Message, Part, Role, Source, ToolCall, ToolInvocation, ToolInvocationState,
};
pub use orchestrator::{tool_handler_fn, ToolHandler, ToolHandlerError};
pub use protocol::{FinishInfo, FinishReason, StreamEvent, StreamMode, Usage};
pub use reconciler::IdGenerator;
pub use session::{
    ChatSession, HandlerChange, HandlerUpdate, Handlers, RequestOptions, SessionBuilder,
    SessionCommand, SessionEvent, SessionHandle, SessionOptions, SessionStatus,
};
pub use transport::{ChatTransport, HttpTransport};
pub use usage::UsageTracker;

/// How a session operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The stream completed and every continuation ran.
    Finished,
    /// Cancelled by `stop`, a preempting request, or a broken body.
    /// Whatever streamed before the interruption stays in the transcript.
    Aborted,
    /// The exchange failed and the error went to the `on_error` handler.
    Failed,
    /// No exchange was needed.
    Idle,
}
