//! Extra request metadata merged into every outgoing exchange.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Default headers. Per-call headers with the same name win.
    pub headers: BTreeMap<String, String>,
    /// Extra top-level body fields.
    pub body: serde_json::Map<String, serde_json::Value>,
}
