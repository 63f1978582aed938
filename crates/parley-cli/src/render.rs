//! Incremental terminal rendering of session events.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

use parley_chat::{FinishInfo, Message, Role, SessionEvent, ToolInvocationState};

/// Prints only what changed since the last event: new assistant text, newly
/// reached tool-call states, data records, finishes and errors.
pub struct Renderer<W: Write> {
    out: W,
    /// Bytes of each message's text already written, by transcript index.
    printed: HashMap<usize, usize>,
    announced: HashSet<(String, ToolInvocationState)>,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: HashMap::new(),
            announced: HashSet::new(),
        }
    }

    pub fn render(&mut self, event: &SessionEvent) -> io::Result<()> {
        match event {
            SessionEvent::MessageUpserted { index, message } => self.message(*index, message)?,
            SessionEvent::TranscriptReplaced { messages } => self.mark_seen(messages),
            SessionEvent::DataAppended { values } => {
                for value in values {
                    writeln!(self.out, "[data] {value}")?;
                }
            }
            SessionEvent::Finished { info, .. } => self.finish(info)?,
            SessionEvent::ErrorChanged(Some(error)) => writeln!(self.out, "\n[error] {error}")?,
            SessionEvent::ErrorChanged(None) | SessionEvent::StatusChanged(_) => {}
        }
        self.out.flush()
    }

    /// Write a line outside the event stream (notices, help).
    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{text}")?;
        self.out.flush()
    }

    fn message(&mut self, index: usize, message: &Message) -> io::Result<()> {
        let content = message.content();
        if message.role != Role::Assistant {
            self.printed.insert(index, content.len());
            return Ok(());
        }

        let printed = self.printed.entry(index).or_insert(0);
        match content.get(*printed..) {
            Some(rest) => write!(self.out, "{rest}")?,
            // The slot was overwritten by a resumed stream.
            None => write!(self.out, "\n{content}")?,
        }
        *printed = content.len();

        for invocation in message.tool_invocations() {
            let key = (invocation.tool_call_id().to_string(), invocation.state());
            if invocation.state() == ToolInvocationState::PartialCall
                || !self.announced.insert(key)
            {
                continue;
            }
            match invocation.result() {
                Some(result) => writeln!(
                    self.out,
                    "\n[tool] {} {} -> {result}",
                    invocation.tool_name(),
                    invocation.tool_call_id()
                )?,
                None => writeln!(
                    self.out,
                    "\n[tool] {}({}) id={}",
                    invocation.tool_name(),
                    invocation.args(),
                    invocation.tool_call_id()
                )?,
            }
        }
        Ok(())
    }

    fn mark_seen(&mut self, messages: &[Message]) {
        self.printed = messages
            .iter()
            .enumerate()
            .map(|(index, message)| (index, message.content().len()))
            .collect();
        self.announced = messages
            .iter()
            .flat_map(Message::tool_invocations)
            .map(|invocation| (invocation.tool_call_id().to_string(), invocation.state()))
            .collect();
    }

    fn finish(&mut self, info: &FinishInfo) -> io::Result<()> {
        write!(self.out, "\n[finish: {}", info.finish_reason.as_str())?;
        if let Some(usage) = info.usage {
            write!(
                self.out,
                ", {} prompt + {} completion tokens",
                usage.prompt_tokens, usage.completion_tokens
            )?;
        }
        writeln!(self.out, "]")
    }

    #[cfg(test)]
    fn output(&self) -> &W {
        &self.out
    }
}
