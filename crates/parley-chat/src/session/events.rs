use serde_json::Value;
use tokio::sync::broadcast;

use super::SessionStatus;
use crate::error::ChatError;
use crate::message::Message;
use crate::protocol::FinishInfo;

/// Transcript and state notifications. Observers rebuild their view from
/// these; the session never reaches into observer state.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The message at `index` was appended or changed.
    MessageUpserted { index: usize, message: Message },
    /// The transcript was replaced wholesale (reload, reset, rollback).
    TranscriptReplaced { messages: Vec<Message> },
    StatusChanged(SessionStatus),
    ErrorChanged(Option<ChatError>),
    DataAppended { values: Vec<Value> },
    Finished { message: Message, info: FinishInfo },
}

pub struct SessionEvents {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}
