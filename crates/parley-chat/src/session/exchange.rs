//! The exchange loop: request, stream, tool handlers, continuation.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::controller::ChatSession;
use super::handle::SessionCommand;
use super::options::RequestOptions;
use super::request;
use super::SessionStatus;
use crate::error::ChatError;
use crate::message::{Message, Role};
use crate::orchestrator::{should_resubmit, ToolOutcome, ToolQueue};
use crate::protocol::{mode_from_headers, EventReader, FinishInfo, ReadItem};
use crate::reconciler::{resolve_tool_result, Applied, Reconciler};
use crate::ExchangeOutcome;
use parley_config::DeferredResubmit;

/// A continuation owed to a tool result that arrived mid-exchange.
pub(crate) struct Deferred {
    /// Transcript to send instead of the live one.
    snapshot: Option<Vec<Message>>,
}

enum ExchangeMode {
    Submit { snapshot: Option<Vec<Message>> },
    Resume,
}

impl ExchangeMode {
    fn continuation() -> Self {
        Self::Submit { snapshot: None }
    }
}

enum Wake<T> {
    Cancelled,
    Command(Option<SessionCommand>),
    ToolSettled,
    Ready(T),
}

impl ChatSession {
    /// Run `command`, then any command that preempted it.
    pub(super) async fn dispatch(
        &mut self,
        mut command: SessionCommand,
    ) -> Result<ExchangeOutcome, ChatError> {
        loop {
            let result = self.run_command(command).await;
            match self.preempted.take() {
                Some(next) => {
                    debug!(session = %self.id, "running preempting command");
                    command = next;
                }
                None => return result,
            }
        }
    }

    async fn run_command(&mut self, command: SessionCommand) -> Result<ExchangeOutcome, ChatError> {
        match command {
            SessionCommand::Append {
                mut message,
                options,
            } => {
                if message.id.is_empty() {
                    message.id = (self.id_gen)();
                }
                message.attachments.extend(options.attachments.iter().cloned());
                self.messages.push(message);
                self.upsert(self.messages.len() - 1);
                self.exchange(ExchangeMode::continuation(), options).await
            }
            SessionCommand::Reload { options } => {
                if self
                    .messages
                    .last()
                    .is_some_and(|message| message.role == Role::Assistant)
                {
                    let mut messages = std::mem::take(&mut self.messages);
                    messages.pop();
                    self.replace_transcript(messages);
                }
                self.exchange(ExchangeMode::continuation(), options).await
            }
            SessionCommand::Resume { options } => self.exchange(ExchangeMode::Resume, options).await,
            SessionCommand::Stop => {
                self.stop();
                Ok(ExchangeOutcome::Idle)
            }
            SessionCommand::AddToolResult {
                tool_call_id,
                result,
            } => {
                let Some(index) = resolve_tool_result(&mut self.messages, &tool_call_id, result)
                else {
                    return Ok(ExchangeOutcome::Idle);
                };
                self.upsert(index);
                if self.last_assistant_resolved() {
                    self.exchange(ExchangeMode::continuation(), RequestOptions::default())
                        .await
                } else {
                    Ok(ExchangeOutcome::Idle)
                }
            }
            SessionCommand::UpdateHandlers(update) => {
                self.handlers.apply(update);
                Ok(ExchangeOutcome::Idle)
            }
        }
    }

    /// One exchange plus its automatic continuations.
    async fn exchange(
        &mut self,
        mut mode: ExchangeMode,
        call: RequestOptions,
    ) -> Result<ExchangeOutcome, ChatError> {
        loop {
            let original_len = self.messages.len();
            let outcome = self.run_once(&mode, &call).await?;
            if outcome != ExchangeOutcome::Finished {
                return Ok(outcome);
            }

            let deferred = self.deferred.take();
            mode = if should_resubmit(original_len, &self.messages, self.options.max_steps) {
                ExchangeMode::continuation()
            } else if let Some(deferred) = deferred {
                if !self.last_assistant_resolved() {
                    debug!(session = %self.id, "dropping deferred continuation, tool calls still open");
                    return Ok(outcome);
                }
                ExchangeMode::Submit {
                    snapshot: deferred.snapshot,
                }
            } else {
                return Ok(outcome);
            };
            debug!(session = %self.id, "continuing with resolved tool calls");
        }
    }

    /// Await `future` while still serving commands. `None` once `abort` fires.
    async fn until_ready<F: Future>(
        &mut self,
        future: F,
        abort: &CancellationToken,
    ) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            let wake = tokio::select! {
                biased;
                _ = abort.cancelled() => Wake::Cancelled,
                command = self.commands_rx.recv(), if self.commands_open => Wake::Command(command),
                output = &mut future => Wake::Ready(output),
            };
            match wake {
                Wake::Cancelled => return None,
                Wake::Command(command) => self.on_command(command, abort),
                Wake::ToolSettled => {}
                Wake::Ready(output) => return Some(output),
            }
        }
    }

    async fn run_once(
        &mut self,
        mode: &ExchangeMode,
        call: &RequestOptions,
    ) -> Result<ExchangeOutcome, ChatError> {
        let abort = CancellationToken::new();
        if let Some(previous) = self.abort.replace(abort.clone()) {
            previous.cancel();
        }
        self.assign_missing_ids();
        let baseline = self.messages.clone();
        self.set_error(None);
        self.set_status(SessionStatus::Submitted);

        let request = match mode {
            ExchangeMode::Submit { snapshot } => {
                let messages = snapshot.as_deref().unwrap_or(&self.messages);
                request::submit_request(&self.id, messages, &self.options, call)
            }
            ExchangeMode::Resume => request::resume_request(&self.id, &self.options, call),
        };
        let request = match request {
            Ok(request) => request,
            Err(e) => return self.fail(e, baseline),
        };
        debug!(session = %self.id, method = request.method.as_str(), url = %request.url, "exchange started");

        let transport = Arc::clone(&self.transport);
        let Some(fetched) = self.until_ready(transport.fetch(request), &abort).await else {
            return Ok(self.interrupt());
        };

        let mut response = match fetched {
            Ok(response) => response,
            Err(e) => return self.fail(e, baseline),
        };
        if let Some(on_response) = self.handlers.active().on_response.clone() {
            on_response(response.status, &response.headers);
        }
        if !response.is_success() {
            let status = response.status;
            let Some(text) = self.until_ready(response.text(), &abort).await else {
                return Ok(self.interrupt());
            };
            return self.fail(ChatError::http(status, &text), baseline);
        }
        let Some(body) = response.body.take() else {
            return self.fail(ChatError::EmptyStream, baseline);
        };

        let stream_mode = mode_from_headers(
            response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
            self.options.stream_mode,
        );
        let replace_last = matches!(mode, ExchangeMode::Resume);
        let mut reader = EventReader::new(body, stream_mode, abort.clone());
        let mut reconciler = Reconciler::new(replace_last, Arc::clone(&self.id_gen));
        let mut tools = ToolQueue::new();

        loop {
            let wake = tokio::select! {
                biased;
                command = self.commands_rx.recv(), if self.commands_open => Wake::Command(command),
                _ = tools.settle_next(), if tools.has_running() => Wake::ToolSettled,
                item = reader.next() => Wake::Ready(item),
            };
            let item = match wake {
                Wake::Command(command) => {
                    self.on_command(command, &abort);
                    continue;
                }
                Wake::Cancelled | Wake::ToolSettled => continue,
                Wake::Ready(item) => item,
            };

            match item {
                ReadItem::Event(event) => {
                    self.set_status(SessionStatus::Streaming);
                    match reconciler.apply(event, &mut self.messages) {
                        Applied::Unchanged => {}
                        Applied::Message { index } => self.upsert(index),
                        Applied::ToolCallReady { index, call } => {
                            self.upsert(index);
                            if let Some(handler) = self.handlers.active().on_tool_call.clone() {
                                tools.spawn(handler, call);
                            }
                        }
                        Applied::Data(values) => self.append_data(values),
                        Applied::Finished { index, info } => self.finish_message(index, &info),
                        Applied::Failed { message } => {
                            return self.fail(ChatError::Stream(message), baseline);
                        }
                    }
                }
                ReadItem::Warning(warning) => {
                    self.set_status(SessionStatus::Streaming);
                    warn!(session = %self.id, error = %warning, "skipping undecodable stream record");
                }
                ReadItem::End if !reader.received_any() => {
                    return self.fail(ChatError::EmptyStream, baseline);
                }
                ReadItem::End => break,
                ReadItem::Aborted => return Ok(self.interrupt()),
            }
        }

        while tools.has_running() {
            let wake = tokio::select! {
                biased;
                _ = abort.cancelled() => Wake::Cancelled,
                command = self.commands_rx.recv(), if self.commands_open => Wake::Command(command),
                _ = tools.settle_all() => Wake::<()>::ToolSettled,
            };
            match wake {
                Wake::Cancelled => return Ok(self.interrupt()),
                Wake::Command(command) => self.on_command(command, &abort),
                Wake::ToolSettled | Wake::Ready(()) => {}
            }
        }
        if abort.is_cancelled() {
            return Ok(self.interrupt());
        }

        let mut tool_error = None;
        for outcome in tools.take_settled() {
            match outcome {
                ToolOutcome::Resolved {
                    tool_call_id,
                    result,
                } => {
                    if let Some(index) = resolve_tool_result(&mut self.messages, &tool_call_id, result)
                    {
                        self.upsert(index);
                    }
                }
                ToolOutcome::Unresolved { tool_call_id } => {
                    debug!(%tool_call_id, "tool call left for an external result");
                }
                ToolOutcome::Failed {
                    tool_call_id,
                    message,
                } => {
                    tool_error.get_or_insert(ChatError::ToolExecution {
                        tool_call_id,
                        message,
                    });
                }
            }
        }
        if let Some(error) = tool_error {
            return self.fail(error, baseline);
        }

        self.abort = None;
        self.set_status(SessionStatus::Ready);
        debug!(session = %self.id, messages = self.messages.len(), "exchange finished");
        Ok(ExchangeOutcome::Finished)
    }

    /// Apply a command that arrived while an exchange is in flight.
    fn on_command(&mut self, command: Option<SessionCommand>, abort: &CancellationToken) {
        let Some(command) = command else {
            self.commands_open = false;
            return;
        };
        match command {
            SessionCommand::Stop => abort.cancel(),
            SessionCommand::AddToolResult {
                tool_call_id,
                result,
            } => self.defer_tool_result(&tool_call_id, result),
            SessionCommand::UpdateHandlers(update) => self.handlers.apply(update),
            preempting => {
                debug!(session = %self.id, "cancelling in-flight exchange for a new request");
                self.preempted = Some(preempting);
                abort.cancel();
            }
        }
    }

    /// Resolve now, continue once the in-flight exchange completes.
    fn defer_tool_result(&mut self, tool_call_id: &str, result: Value) {
        let Some(index) = resolve_tool_result(&mut self.messages, tool_call_id, result) else {
            return;
        };
        self.upsert(index);
        let snapshot = match self.options.deferred_resubmit {
            DeferredResubmit::PostCompletion => None,
            DeferredResubmit::OriginSnapshot => Some(self.messages.clone()),
        };
        debug!(tool_call_id, "tool result deferred until the exchange completes");
        self.deferred = Some(Deferred { snapshot });
    }

    fn finish_message(&mut self, index: Option<usize>, info: &FinishInfo) {
        self.usage.record(info);
        let message = index
            .and_then(|index| self.messages.get(index).cloned())
            .unwrap_or_else(|| Message::new(Role::Assistant));
        debug!(
            session = %self.id,
            finish_reason = info.finish_reason.as_str(),
            total_tokens = info.usage.map(|usage| usage.total_tokens()),
            "message finished"
        );
        if let Some(on_finish) = self.handlers.active().on_finish.clone() {
            on_finish(&message, info);
        }
        self.events.publish(super::SessionEvent::Finished {
            message,
            info: *info,
        });
    }

    fn assign_missing_ids(&mut self) {
        for index in 0..self.messages.len() {
            if self.messages[index].id.is_empty() {
                self.messages[index].id = (self.id_gen)();
                self.upsert(index);
            }
        }
    }

    /// Cancellation: keep whatever streamed, drop pending tool work.
    fn interrupt(&mut self) -> ExchangeOutcome {
        debug!(session = %self.id, "exchange aborted");
        self.abort = None;
        self.deferred = None;
        self.set_status(SessionStatus::Ready);
        ExchangeOutcome::Aborted
    }

    fn fail(
        &mut self,
        error: ChatError,
        baseline: Vec<Message>,
    ) -> Result<ExchangeOutcome, ChatError> {
        warn!(session = %self.id, error = %error, "exchange failed");
        self.abort = None;
        self.deferred = None;
        if self.options.drop_last_message_on_error && self.messages != baseline {
            self.replace_transcript(baseline);
        }
        self.set_error(Some(error.clone()));
        self.set_status(SessionStatus::Error);
        match self.handlers.active().on_error.clone() {
            Some(on_error) => {
                on_error(&error);
                Ok(ExchangeOutcome::Failed)
            }
            None => Err(error),
        }
    }
}
