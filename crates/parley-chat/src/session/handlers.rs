use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ChatError;
use crate::message::Message;
use crate::orchestrator::ToolHandler;
use crate::protocol::FinishInfo;

/// Called once per finished assistant message.
pub type FinishHandler = Arc<dyn Fn(&Message, &FinishInfo) + Send + Sync>;
/// Receives exchange failures. When set, failures are not returned to the caller.
pub type ErrorHandler = Arc<dyn Fn(&ChatError) + Send + Sync>;
/// Sees the status and (lowercase) headers of every response before its body is read.
pub type ResponseHandler = Arc<dyn Fn(u16, &BTreeMap<String, String>) + Send + Sync>;

/// Callbacks attached to a session.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_finish: Option<FinishHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_response: Option<ResponseHandler>,
    /// Client-side executor for tool calls.
    pub on_tool_call: Option<Arc<dyn ToolHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_finish(mut self, f: impl Fn(&Message, &FinishInfo) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ChatError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_response(
        mut self,
        f: impl Fn(u16, &BTreeMap<String, String>) + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(f));
        self
    }

    pub fn on_tool_call(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.on_tool_call = Some(handler);
        self
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_finish", &self.on_finish.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .finish()
    }
}

/// Edit to one handler slot.
#[derive(Clone)]
pub enum HandlerChange<T> {
    Keep,
    Set(T),
    /// Revert to the handler the session was built with.
    Unset,
}

impl<T> Default for HandlerChange<T> {
    fn default() -> Self {
        Self::Keep
    }
}

impl<T: Clone> HandlerChange<T> {
    fn apply(self, active: &mut Option<T>, configured: &Option<T>) {
        match self {
            Self::Keep => {}
            Self::Set(handler) => *active = Some(handler),
            Self::Unset => active.clone_from(configured),
        }
    }
}

impl<T> fmt::Debug for HandlerChange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keep => "Keep",
            Self::Set(_) => "Set(..)",
            Self::Unset => "Unset",
        })
    }
}

/// Batch of handler edits applied atomically. The latest update wins.
#[derive(Debug, Clone, Default)]
pub struct HandlerUpdate {
    pub on_finish: HandlerChange<FinishHandler>,
    pub on_error: HandlerChange<ErrorHandler>,
    pub on_response: HandlerChange<ResponseHandler>,
    pub on_tool_call: HandlerChange<Arc<dyn ToolHandler>>,
}

/// Active handlers plus the construction-time set that `Unset` reverts to.
#[derive(Debug, Clone)]
pub(crate) struct HandlerSet {
    configured: Handlers,
    active: Handlers,
}

impl HandlerSet {
    pub fn new(configured: Handlers) -> Self {
        Self {
            active: configured.clone(),
            configured,
        }
    }

    pub fn active(&self) -> &Handlers {
        &self.active
    }

    pub fn apply(&mut self, update: HandlerUpdate) {
        update
            .on_finish
            .apply(&mut self.active.on_finish, &self.configured.on_finish);
        update
            .on_error
            .apply(&mut self.active.on_error, &self.configured.on_error);
        update
            .on_response
            .apply(&mut self.active.on_response, &self.configured.on_response);
        update
            .on_tool_call
            .apply(&mut self.active.on_tool_call, &self.configured.on_tool_call);
    }
}
