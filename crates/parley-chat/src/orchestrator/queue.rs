use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::ToolHandler;
use crate::message::ToolCall;

/// What a client-side handler produced for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Resolved { tool_call_id: String, result: Value },
    /// The handler declined; the call waits for an external result.
    Unresolved { tool_call_id: String },
    Failed { tool_call_id: String, message: String },
}

type Running = BoxFuture<'static, (u64, ToolOutcome)>;

/// In-flight handler invocations for one exchange.
///
/// Handlers run concurrently while the stream is still being read; their
/// outcomes are held back and released in call-arrival order, so the
/// transcript sees results in the same order the calls streamed in.
#[derive(Default)]
pub(crate) struct ToolQueue {
    running: FuturesUnordered<Running>,
    settled: BTreeMap<u64, ToolOutcome>,
    next_seq: u64,
}

impl ToolQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, handler: Arc<dyn ToolHandler>, call: ToolCall) {
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(tool_call_id = %call.tool_call_id, tool = %call.tool_name, seq, "invoking tool handler");

        let future = async move {
            let outcome = match handler.handle(&call).await {
                Ok(Some(result)) => ToolOutcome::Resolved {
                    tool_call_id: call.tool_call_id,
                    result,
                },
                Ok(None) => ToolOutcome::Unresolved {
                    tool_call_id: call.tool_call_id,
                },
                Err(e) => {
                    warn!(tool_call_id = %call.tool_call_id, error = %e, "tool handler failed");
                    ToolOutcome::Failed {
                        tool_call_id: call.tool_call_id,
                        message: e.to_string(),
                    }
                }
            };
            (seq, outcome)
        };
        self.running.push(future.boxed());
    }

    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Wait for the next handler to settle. Pending forever when idle, so it
    /// can sit in a `select!` without spinning.
    pub async fn settle_next(&mut self) {
        match self.running.next().await {
            Some((seq, outcome)) => {
                self.settled.insert(seq, outcome);
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Wait for every running handler.
    pub async fn settle_all(&mut self) {
        while let Some((seq, outcome)) = self.running.next().await {
            self.settled.insert(seq, outcome);
        }
    }

    /// Settled outcomes in call-arrival order.
    pub fn take_settled(&mut self) -> Vec<ToolOutcome> {
        std::mem::take(&mut self.settled).into_values().collect()
    }

    /// Drop running handlers and unreleased outcomes.
    pub fn clear(&mut self) {
        self.running = FuturesUnordered::new();
        self.settled.clear();
    }
}
