//! Folds decoded stream events into the transcript.
//!
//! A [`Reconciler`] owns no messages; it mutates the session's transcript in
//! place and reports what changed so the caller can notify observers. It
//! works on exactly one assistant message per exchange: the first
//! content-bearing event either appends a fresh assistant message or, in
//! replace-last mode, overwrites the trailing assistant slot.


use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::message::{Message, Part, Role, ToolCall, ToolInvocation};
use crate::protocol::{FinishInfo, StreamEvent};

/// Source of fresh message ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Unchanged,
    /// The message at `index` was created or mutated.
    Message { index: usize },
    /// A tool call reached state `call` in the message at `index`.
    ToolCallReady { index: usize, call: ToolCall },
    /// Values for the session's streaming-data channel.
    Data(Vec<Value>),
    Finished {
        index: Option<usize>,
        info: FinishInfo,
    },
    /// The server sent an error record.
    Failed { message: String },
}

pub struct Reconciler {
    replace_last: bool,
    id_gen: IdGenerator,
    /// Slot of the assistant message being built, once created.
    index: Option<usize>,
    step: u32,
    /// Whether the next text/reasoning delta may extend the trailing part.
    segment_open: bool,
    finished: bool,
    /// Results already attached to the message a resume replaced, keyed by
    /// call id. Reapplied when the resumed stream repeats the call.
    carried: HashMap<String, Value>,
}

impl Reconciler {
    pub fn new(replace_last: bool, id_gen: IdGenerator) -> Self {
        Self {
            replace_last,
            id_gen,
            index: None,
            step: 0,
            segment_open: false,
            finished: false,
            carried: HashMap::new(),
        }
    }

    pub fn message_index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn apply(&mut self, event: StreamEvent, messages: &mut Vec<Message>) -> Applied {
        if self.finished {
            warn!(tag = event.tag(), "event after message finish ignored");
            return Applied::Unchanged;
        }

        match event {
            StreamEvent::TextDelta(text) => self.push_text(messages, text, false),
            StreamEvent::ReasoningDelta(text) => self.push_text(messages, text, true),
            StreamEvent::DataDelta(values) => Applied::Data(values),
            StreamEvent::MessageAnnotations(values) => {
                let index = self.current(messages);
                let parts = &mut messages[index].parts;
                parts.extend(values.into_iter().map(|data| Part::Data { data }));
                self.segment_open = false;
                Applied::Message { index }
            }
            StreamEvent::Error(message) => Applied::Failed { message },
            StreamEvent::ToolCallStreamStart(start) => {
                let index = self.current(messages);
                let message = &mut messages[index];
                if message.tool_invocation(&start.tool_call_id).is_some() {
                    warn!(tool_call_id = %start.tool_call_id, "duplicate tool call stream start");
                    return Applied::Unchanged;
                }
                message.parts.push(Part::ToolInvocation {
                    tool_invocation: ToolInvocation::partial(
                        start.tool_call_id,
                        start.tool_name,
                        self.step,
                    ),
                });
                self.segment_open = false;
                Applied::Message { index }
            }
            StreamEvent::ToolCallArgDelta(delta) => {
                let index = self.current(messages);
                let Some(invocation) = messages[index].tool_invocation_mut(&delta.tool_call_id)
                else {
                    warn!(tool_call_id = %delta.tool_call_id, "argument delta for unknown tool call");
                    return Applied::Unchanged;
                };
                if invocation.push_args_delta(&delta.args_text_delta) {
                    Applied::Message { index }
                } else {
                    Applied::Unchanged
                }
            }
            StreamEvent::ToolCall(call) => self.complete_call(messages, call),
            StreamEvent::ToolResult(result) => {
                match resolve_tool_result(messages, &result.tool_call_id, result.result) {
                    Some(index) => Applied::Message { index },
                    None => Applied::Unchanged,
                }
            }
            StreamEvent::StepStart { message_id } => {
                let index = self.current(messages);
                let message = &mut messages[index];
                if !self.replace_last && !message_id.is_empty() {
                    message.id = message_id;
                }
                message.parts.push(Part::StepBoundary);
                self.segment_open = false;
                Applied::Message { index }
            }
            StreamEvent::StepFinish(step) => {
                self.step += 1;
                if !step.is_continued {
                    self.segment_open = false;
                }
                Applied::Unchanged
            }
            StreamEvent::MessageFinish(info) => {
                self.finished = true;
                Applied::Finished {
                    index: self.index,
                    info,
                }
            }
            StreamEvent::Source(source) => {
                let index = self.current(messages);
                messages[index].parts.push(Part::Source { source });
                self.segment_open = false;
                Applied::Message { index }
            }
            StreamEvent::File(file) => {
                let index = self.current(messages);
                messages[index].parts.push(Part::File {
                    mime_type: file.mime_type,
                    data: file.data,
                });
                self.segment_open = false;
                Applied::Message { index }
            }
        }
    }

    /// Index of the message under construction, creating it on first use.
    fn current(&mut self, messages: &mut Vec<Message>) -> usize {
        if let Some(index) = self.index {
            return index;
        }
        let fresh = Message::new(Role::Assistant);
        let index = match messages.last_mut() {
            Some(last) if self.replace_last && last.role == Role::Assistant => {
                self.carried = last
                    .tool_invocations()
                    .filter_map(|invocation| {
                        let result = invocation.result()?.clone();
                        Some((invocation.tool_call_id().to_string(), result))
                    })
                    .collect();
                let id = std::mem::take(&mut last.id);
                let created_at = last.created_at;
                *last = Message {
                    id,
                    created_at,
                    ..fresh
                };
                messages.len() - 1
            }
            _ => {
                messages.push(fresh.with_id((self.id_gen)()));
                messages.len() - 1
            }
        };
        self.index = Some(index);
        index
    }

    fn push_text(&mut self, messages: &mut Vec<Message>, text: String, reasoning: bool) -> Applied {
        if text.is_empty() {
            return Applied::Unchanged;
        }
        let index = self.current(messages);
        let parts = &mut messages[index].parts;
        let extended = match (self.segment_open, parts.last_mut()) {
            (true, Some(Part::Text { text: current })) if !reasoning => {
                current.push_str(&text);
                true
            }
            (true, Some(Part::Reasoning { reasoning: current })) if reasoning => {
                current.push_str(&text);
                true
            }
            _ => false,
        };
        if !extended {
            parts.push(if reasoning {
                Part::Reasoning { reasoning: text }
            } else {
                Part::Text { text }
            });
        }
        self.segment_open = true;
        Applied::Message { index }
    }

    fn complete_call(&mut self, messages: &mut Vec<Message>, call: ToolCall) -> Applied {
        let index = self.current(messages);
        let message = &mut messages[index];
        let ready = match message.tool_invocation_mut(&call.tool_call_id) {
            Some(invocation) => {
                if !invocation.complete_call(&call.tool_name, call.args) {
                    return Applied::Unchanged;
                }
                invocation.to_tool_call()
            }
            None => {
                let invocation = ToolInvocation::call(call, self.step);
                let ready = invocation.to_tool_call();
                message.parts.push(Part::ToolInvocation {
                    tool_invocation: invocation,
                });
                ready
            }
        };
        self.segment_open = false;

        if let Some(result) = self.carried.remove(&ready.tool_call_id) {
            debug!(tool_call_id = %ready.tool_call_id, "reattaching result from the replaced message");
            if let Some(invocation) = messages[index].tool_invocation_mut(&ready.tool_call_id) {
                invocation.resolve(result);
            }
            return Applied::Message { index };
        }
        Applied::ToolCallReady { index, call: ready }
    }
}

/// Attach a result to the newest invocation with this id. Returns the index
/// of the message that changed, or `None` when nothing matched or the call
/// was already resolved.
pub fn resolve_tool_result(
    messages: &mut [Message],
    tool_call_id: &str,
    result: Value,
) -> Option<usize> {
    let found = messages
        .iter_mut()
        .enumerate()
        .rev()
        .find_map(|(index, message)| {
            message
                .tool_invocation_mut(tool_call_id)
                .map(|invocation| (index, invocation))
        });
    match found {
        Some((index, invocation)) => invocation.resolve(result).then_some(index),
        None => {
            warn!(tool_call_id, "tool result for unknown tool call");
            None
        }
    }
}
