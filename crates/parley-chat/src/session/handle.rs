use serde_json::Value;
use tokio::sync::mpsc;

use super::handlers::HandlerUpdate;
use super::options::RequestOptions;
use crate::message::Message;

/// Action trigger queued for the session's event loop.
#[derive(Debug)]
pub enum SessionCommand {
    Append {
        message: Message,
        options: RequestOptions,
    },
    Reload {
        options: RequestOptions,
    },
    Resume {
        options: RequestOptions,
    },
    Stop,
    AddToolResult {
        tool_call_id: String,
        result: Value,
    },
    UpdateHandlers(HandlerUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chat session has shut down")]
pub struct SessionClosed;

/// Cloneable sender of [`SessionCommand`]s.
///
/// `stop`, `add_tool_result` and `update_handlers` take effect between the
/// events of an in-flight exchange. `append`, `reload` and `resume` cancel
/// the in-flight exchange and run once it has wound down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { tx }
    }

    pub fn send(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        self.tx.send(command).map_err(|_| SessionClosed)
    }

    pub fn append(&self, message: Message, options: RequestOptions) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Append { message, options })
    }

    pub fn reload(&self, options: RequestOptions) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Reload { options })
    }

    pub fn resume(&self, options: RequestOptions) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Resume { options })
    }

    pub fn stop(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Stop)
    }

    pub fn add_tool_result(
        &self,
        tool_call_id: impl Into<String>,
        result: Value,
    ) -> Result<(), SessionClosed> {
        self.send(SessionCommand::AddToolResult {
            tool_call_id: tool_call_id.into(),
            result,
        })
    }

    pub fn update_handlers(&self, update: HandlerUpdate) -> Result<(), SessionClosed> {
        self.send(SessionCommand::UpdateHandlers(update))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
