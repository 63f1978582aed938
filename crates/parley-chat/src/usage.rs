//! Token usage tracking across the exchanges of one session.

use std::collections::HashMap;

use crate::protocol::{FinishInfo, FinishReason, Usage};

/// Cumulative usage reported by message-finish records.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    total: Usage,
    /// Finished messages broken down by why they stopped.
    by_reason: HashMap<FinishReason, u64>,
    finish_count: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            total: Usage::default(),
            by_reason: HashMap::new(),
            finish_count: 0,
        }
    }

    pub fn record(&mut self, info: &FinishInfo) {
        if let Some(usage) = info.usage {
            self.total.prompt_tokens = self.total.prompt_tokens.saturating_add(usage.prompt_tokens);
            self.total.completion_tokens = self
                .total
                .completion_tokens
                .saturating_add(usage.completion_tokens);
        }
        self.finish_count += 1;
        *self.by_reason.entry(info.finish_reason).or_default() += 1;
    }

    pub fn total(&self) -> &Usage {
        &self.total
    }

    pub fn total_tokens(&self) -> u64 {
        self.total.total_tokens()
    }

    /// Number of messages that finished with `reason`.
    pub fn finishes(&self, reason: FinishReason) -> u64 {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }

    pub fn finish_count(&self) -> u64 {
        self.finish_count
    }

    pub fn reset(&mut self) {
        self.total = Usage::default();
        self.by_reason.clear();
        self.finish_count = 0;
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}
