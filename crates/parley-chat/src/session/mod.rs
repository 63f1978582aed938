//! Session controller.
//!
//! [`ChatSession`] owns the transcript and the status machine
//! (`ready -> submitted -> streaming -> ready`, with `error` on failure and
//! any state returning to `ready` on abort). It builds requests, wires the
//! decoder into the reconciler, runs client-side tool handlers, and decides
//! on automatic continuation. At most one exchange is in flight.
//!
//! Observers [`subscribe`](ChatSession::subscribe) to [`SessionEvent`]s;
//! other tasks drive the session through a cloneable [`SessionHandle`].

mod controller;
mod events;
mod exchange;
mod handle;
mod handlers;
mod options;
mod request;

#[cfg(test)]
mod tests;

pub use controller::{ChatSession, SessionBuilder};
pub use events::{SessionEvent, SessionEvents};
pub use handle::{SessionClosed, SessionCommand, SessionHandle};
pub use handlers::{
    ErrorHandler, FinishHandler, HandlerChange, HandlerUpdate, Handlers, ResponseHandler,
};
pub use options::{RequestOptions, SessionOptions};

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Ready,
    /// Request sent, no body bytes yet.
    Submitted,
    Streaming,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Submitted => "submitted",
            Self::Streaming => "streaming",
            Self::Error => "error",
        }
    }

    /// Whether an exchange is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Submitted | Self::Streaming)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
