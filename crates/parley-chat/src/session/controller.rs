use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{SessionEvent, SessionEvents};
use super::exchange::Deferred;
use super::handle::{SessionCommand, SessionHandle};
use super::handlers::{HandlerSet, HandlerUpdate, Handlers};
use super::options::{RequestOptions, SessionOptions};
use super::SessionStatus;
use crate::error::ChatError;
use crate::message::{Message, Role};
use crate::reconciler::IdGenerator;
use crate::transport::{ChatTransport, HttpTransport};
use crate::usage::UsageTracker;
use crate::ExchangeOutcome;
use parley_common::{new_message_id, SessionId};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Explicit session factory.
pub struct SessionBuilder {
    options: SessionOptions,
    transport: Option<Arc<dyn ChatTransport>>,
    handlers: Handlers,
    id_gen: Option<IdGenerator>,
    event_capacity: usize,
}

impl SessionBuilder {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            transport: None,
            handlers: Handlers::default(),
            id_gen: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Network client. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Message id source. Defaults to `msg-` prefixed random ids.
    pub fn id_generator(mut self, id_gen: IdGenerator) -> Self {
        self.id_gen = Some(id_gen);
        self
    }

    /// Buffer size of the observer channel; slow subscribers lag past it.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ChatSession {
        let transport: Arc<dyn ChatTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()),
        };
        let id_gen: IdGenerator = match self.id_gen {
            Some(id_gen) => id_gen,
            None => Arc::new(new_message_id),
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        ChatSession {
            id: self.options.id.clone().unwrap_or_default(),
            messages: self.options.initial_messages.clone(),
            options: self.options,
            transport,
            id_gen,
            status: SessionStatus::Ready,
            error: None,
            streaming_data: Vec::new(),
            handlers: HandlerSet::new(self.handlers),
            events: SessionEvents::new(self.event_capacity),
            usage: UsageTracker::new(),
            commands_tx,
            commands_rx,
            commands_open: true,
            abort: None,
            preempted: None,
            deferred: None,
        }
    }
}

/// One conversation with a chat endpoint.
pub struct ChatSession {
    pub(super) id: SessionId,
    pub(super) options: SessionOptions,
    pub(super) transport: Arc<dyn ChatTransport>,
    pub(super) id_gen: IdGenerator,
    pub(super) messages: Vec<Message>,
    pub(super) status: SessionStatus,
    pub(super) error: Option<ChatError>,
    pub(super) streaming_data: Vec<Value>,
    pub(super) handlers: HandlerSet,
    pub(super) events: SessionEvents,
    pub(super) usage: UsageTracker,
    pub(super) commands_tx: mpsc::UnboundedSender<SessionCommand>,
    pub(super) commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    /// False once every sender is gone.
    pub(super) commands_open: bool,
    /// Cancels the in-flight exchange.
    pub(super) abort: Option<CancellationToken>,
    /// Command that cancelled the in-flight exchange and runs next.
    pub(super) preempted: Option<SessionCommand>,
    pub(super) deferred: Option<Deferred>,
}

impl ChatSession {
    /// Session over HTTP with no handlers.
    pub fn new(options: SessionOptions) -> Self {
        SessionBuilder::new(options).build()
    }

    pub fn builder(options: SessionOptions) -> SessionBuilder {
        SessionBuilder::new(options)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&ChatError> {
        self.error.as_ref()
    }

    pub fn streaming_data(&self) -> &[Value] {
        &self.streaming_data
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn handlers(&self) -> &Handlers {
        self.handlers.active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.commands_tx.clone())
    }

    /// Append a message (usually a user turn) and run an exchange.
    /// Missing ids are assigned before the request is sent.
    pub async fn append(
        &mut self,
        message: Message,
        options: RequestOptions,
    ) -> Result<ExchangeOutcome, ChatError> {
        self.dispatch(SessionCommand::Append { message, options }).await
    }

    /// Drop a trailing assistant message and resubmit the transcript.
    pub async fn reload(&mut self, options: RequestOptions) -> Result<ExchangeOutcome, ChatError> {
        self.dispatch(SessionCommand::Reload { options }).await
    }

    /// Reattach to a stream the server is still producing for this session.
    /// Its output replaces the trailing assistant message.
    pub async fn resume(&mut self, options: RequestOptions) -> Result<ExchangeOutcome, ChatError> {
        self.dispatch(SessionCommand::Resume { options }).await
    }

    /// Resolve a tool call. Once the last assistant message has every call
    /// resolved, its continuation is requested.
    pub async fn add_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        result: Value,
    ) -> Result<ExchangeOutcome, ChatError> {
        self.dispatch(SessionCommand::AddToolResult {
            tool_call_id: tool_call_id.into(),
            result,
        })
        .await
    }

    /// Cancel the in-flight exchange, if any. Streamed content is kept.
    pub fn stop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.cancel();
            self.set_status(SessionStatus::Ready);
        }
    }

    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.replace_transcript(messages);
    }

    /// Back to the initial transcript with no error and no streamed data.
    pub fn reset(&mut self) {
        self.stop();
        self.replace_transcript(self.options.initial_messages.clone());
        self.streaming_data.clear();
        self.set_error(None);
        self.set_status(SessionStatus::Ready);
    }

    pub fn clear_error(&mut self) {
        self.set_error(None);
        if self.status == SessionStatus::Error {
            self.set_status(SessionStatus::Ready);
        }
    }

    pub fn set_streaming_data(&mut self, values: Vec<Value>) {
        self.streaming_data = values;
    }

    pub fn update_handlers(&mut self, update: HandlerUpdate) {
        self.handlers.apply(update);
    }

    /// Run queued handle commands without waiting for new ones. Returns the
    /// outcome of the last command; the first failure stops the drain.
    pub async fn run_pending(&mut self) -> Result<ExchangeOutcome, ChatError> {
        let mut outcome = ExchangeOutcome::Idle;
        while let Ok(command) = self.commands_rx.try_recv() {
            outcome = self.dispatch(command).await?;
        }
        Ok(outcome)
    }

    /// Act on handle commands until every [`SessionHandle`] is dropped, then
    /// hand the session back.
    pub async fn serve(mut self) -> Self {
        let (detached, _) = mpsc::unbounded_channel();
        self.commands_tx = detached;
        debug!(session = %self.id, "serving session commands");

        while let Some(command) = self.commands_rx.recv().await {
            if let Err(e) = self.dispatch(command).await {
                warn!(session = %self.id, error = %e, "session command failed");
            }
        }

        debug!(session = %self.id, "all session handles dropped");
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.commands_tx = commands_tx;
        self.commands_rx = commands_rx;
        self.commands_open = true;
        self
    }

    pub(super) fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!(session = %self.id, from = %self.status, to = %status, "status changed");
            self.status = status;
            self.events.publish(SessionEvent::StatusChanged(status));
        }
    }

    pub(super) fn set_error(&mut self, error: Option<ChatError>) {
        if self.error != error {
            self.error = error.clone();
            self.events.publish(SessionEvent::ErrorChanged(error));
        }
    }

    pub(super) fn upsert(&mut self, index: usize) {
        if let Some(message) = self.messages.get(index) {
            self.events.publish(SessionEvent::MessageUpserted {
                index,
                message: message.clone(),
            });
        }
    }

    pub(super) fn replace_transcript(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.events.publish(SessionEvent::TranscriptReplaced {
            messages: self.messages.clone(),
        });
    }

    pub(super) fn append_data(&mut self, values: Vec<Value>) {
        self.streaming_data.extend(values.iter().cloned());
        self.events.publish(SessionEvent::DataAppended { values });
    }

    /// Whether the last message is an assistant turn whose tool calls are
    /// all resolved.
    pub(super) fn last_assistant_resolved(&self) -> bool {
        self.messages.last().is_some_and(|message| {
            message.role == Role::Assistant
                && message.tool_invocations().next().is_some()
                && message.tool_calls_resolved()
        })
    }
}
