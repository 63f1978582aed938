use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered segment of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        reasoning: String,
    },
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: ToolInvocation,
    },
    /// Message annotation sent alongside the stream.
    Data {
        data: Value,
    },
    Source {
        source: Source,
    },
    File {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
    /// Separates sequential generation steps inside one message.
    #[serde(rename = "step-start")]
    StepBoundary,
}

/// Citation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default = "default_source_type")]
    pub source_type: String,
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

fn default_source_type() -> String {
    "url".into()
}

/// Tool invocation lifecycle. Ordered: a state never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolInvocationState {
    PartialCall,
    Call,
    Result,
}

/// A fully specified tool call, as handed to client-side tool handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    tool_call_id: String,
    tool_name: String,
    state: ToolInvocationState,
    #[serde(default)]
    step: u32,
    #[serde(default)]
    args: Value,
    /// Raw argument text accumulated while in `partial-call`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    args_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

impl ToolInvocation {
    /// Invocation whose arguments are still streaming.
    pub fn partial(tool_call_id: impl Into<String>, tool_name: impl Into<String>, step: u32) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolInvocationState::PartialCall,
            step,
            args: Value::Null,
            args_text: String::new(),
            result: None,
        }
    }

    pub fn call(call: ToolCall, step: u32) -> Self {
        Self {
            tool_call_id: call.tool_call_id,
            tool_name: call.tool_name,
            state: ToolInvocationState::Call,
            step,
            args: call.args,
            args_text: String::new(),
            result: None,
        }
    }

    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn state(&self) -> ToolInvocationState {
        self.state
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn args_text(&self) -> &str {
        &self.args_text
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn to_tool_call(&self) -> ToolCall {
        ToolCall {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            args: self.args.clone(),
        }
    }

    /// Append streamed argument text. Only valid in `partial-call`; the state
    /// is never promoted here, even if the buffer happens to parse.
    pub(crate) fn push_args_delta(&mut self, delta: &str) -> bool {
        if self.state != ToolInvocationState::PartialCall {
            return false;
        }
        self.args_text.push_str(delta);
        true
    }

    /// Move to `call` with definitive arguments. Refused once resolved, and
    /// a repeat of the call already recorded is a no-op.
    pub(crate) fn complete_call(&mut self, tool_name: &str, args: Value) -> bool {
        match self.state {
            ToolInvocationState::Result => return false,
            ToolInvocationState::Call
                if self.args == args && (tool_name.is_empty() || tool_name == self.tool_name) =>
            {
                return false;
            }
            _ => {}
        }
        if !tool_name.is_empty() {
            self.tool_name = tool_name.to_string();
        }
        self.state = ToolInvocationState::Call;
        self.args = args;
        self.args_text.clear();
        true
    }

    /// Attach a result. The first result wins; later ones are refused.
    pub(crate) fn resolve(&mut self, result: Value) -> bool {
        if self.state == ToolInvocationState::Result {
            return false;
        }
        self.state = ToolInvocationState::Result;
        self.result = Some(result);
        true
    }
}
