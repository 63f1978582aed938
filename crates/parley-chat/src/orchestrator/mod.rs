//! Tool-call lifecycle and the automatic continuation decision.

mod queue;

pub use queue::ToolOutcome;
pub(crate) use queue::ToolQueue;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::message::{max_tool_step, Message, Role, ToolCall};

pub type ToolHandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Client-side tool executor. `Ok(None)` leaves the call unresolved so an
/// external `add_tool_result` can supply the answer later.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, call: &ToolCall) -> Result<Option<Value>, ToolHandlerError>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnToolHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnToolHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>, ToolHandlerError>> + Send,
{
    async fn handle(&self, call: &ToolCall) -> Result<Option<Value>, ToolHandlerError> {
        (self.f)(call.clone()).await
    }
}

pub fn tool_handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, ToolHandlerError>> + Send + 'static,
{
    Arc::new(FnToolHandler { f })
}

/// Number of consecutive assistant messages at the end of the transcript.
pub fn trailing_assistant_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .rev()
        .take_while(|message| message.role == Role::Assistant)
        .count()
}

/// Whether the session must issue a follow-up exchange on its own.
///
/// Requires all of the following. The transcript grew since `original_len`.
/// The last message is an assistant message carrying tool calls, all of
/// them resolved. `max_steps` is above 1. Fewer than `max_steps` assistant
/// messages trail the transcript.
pub fn should_resubmit(original_len: usize, messages: &[Message], max_steps: u32) -> bool {
    let Some(last) = messages.last() else {
        return false;
    };
    let grew = messages.len() > original_len;
    let resolved = last.role == Role::Assistant && last.tool_calls_resolved();
    let trailing = trailing_assistant_count(messages);
    let decision =
        grew && resolved && max_steps > 1 && trailing < max_steps as usize && has_tool_calls(last);

    debug!(
        grew,
        resolved,
        trailing,
        steps = max_tool_step(last),
        max_steps,
        decision,
        "continuation check"
    );
    decision
}

/// Tool-free assistant turns are final answers.
fn has_tool_calls(message: &Message) -> bool {
    max_tool_step(message) > 0
}
