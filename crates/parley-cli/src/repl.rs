//! Prompt loop: turns input lines into session operations and renders the
//! resulting events while each exchange runs.

use std::io::{self, Write};

use parley_chat::{ChatError, ChatSession, ExchangeOutcome, Message, RequestOptions, SessionEvent};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::render::Renderer;

const HELP: &str = "\
/reload             regenerate the last answer
/resume             reattach to the stream in progress for this chat
/result <id> <json> answer a pending tool call
/reset              start over with an empty transcript
/quit               exit (Ctrl-D also works)
Ctrl-C stops the answer being streamed.";

/// One operation that runs an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(String),
    Reload,
    Resume,
    ToolResult { tool_call_id: String, result: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Action(Action),
    Reset,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Action(Action::Send(line.to_string()));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));
    match name {
        "reload" => Input::Action(Action::Reload),
        "resume" => Input::Action(Action::Resume),
        "reset" => Input::Reset,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        "result" => {
            let Some((id, raw)) = rest.split_once(char::is_whitespace) else {
                return Input::Invalid("usage: /result <tool-call-id> <json>".into());
            };
            let raw = raw.trim();
            // Bare words are taken as strings.
            let result =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Input::Action(Action::ToolResult {
                tool_call_id: id.to_string(),
                result,
            })
        }
        other => Input::Invalid(format!("unknown command /{other}; try /help")),
    }
}

pub struct Repl {
    session: ChatSession,
    events: broadcast::Receiver<SessionEvent>,
    renderer: Renderer<io::Stdout>,
}

impl Repl {
    pub fn new(session: ChatSession) -> Self {
        let events = session.subscribe();
        Self {
            session,
            events,
            renderer: Renderer::new(io::stdout()),
        }
    }

    pub async fn send(&mut self, text: String) -> bool {
        self.drive(Action::Send(text)).await
    }

    pub async fn resume(&mut self) -> bool {
        self.drive(Action::Resume).await
    }

    pub async fn run_stdin(&mut self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            let _ = io::stdout().flush();

            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = tokio::signal::ctrl_c() => break,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            };

            match parse_input(&line) {
                Input::Action(action) => {
                    self.drive(action).await;
                }
                Input::Reset => {
                    self.session.reset();
                    self.drain();
                    self.notice("[transcript cleared]");
                }
                Input::Help => self.notice(HELP),
                Input::Quit => break,
                Input::Empty => {}
                Input::Invalid(message) => self.notice(&message),
            }
        }
        println!();
    }

    /// Run one action to completion, rendering events as they arrive.
    /// Returns `false` when the exchange failed.
    async fn drive(&mut self, action: Action) -> bool {
        debug!(?action, "running action");
        let handle = self.session.handle();
        let result: Result<ExchangeOutcome, ChatError> = {
            let session = &mut self.session;
            let events = &mut self.events;
            let renderer = &mut self.renderer;

            let exchange = async move {
                match action {
                    Action::Send(text) => {
                        session
                            .append(Message::user(text), RequestOptions::default())
                            .await
                    }
                    Action::Reload => session.reload(RequestOptions::default()).await,
                    Action::Resume => session.resume(RequestOptions::default()).await,
                    Action::ToolResult {
                        tool_call_id,
                        result,
                    } => session.add_tool_result(tool_call_id, result).await,
                }
            };
            tokio::pin!(exchange);

            let mut events_open = true;
            loop {
                tokio::select! {
                    result = &mut exchange => break result,
                    event = events.recv(), if events_open => match event {
                        Ok(event) => {
                            if let Err(e) = renderer.render(&event) {
                                warn!(error = %e, "failed to write output");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "renderer fell behind");
                        }
                        Err(RecvError::Closed) => events_open = false,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        let _ = handle.stop();
                    }
                }
            }
        };
        self.drain();

        match result {
            Ok(ExchangeOutcome::Aborted) => {
                self.notice("\n[stopped]");
                true
            }
            Ok(ExchangeOutcome::Idle) => {
                self.notice("[nothing to send]");
                true
            }
            Ok(ExchangeOutcome::Finished | ExchangeOutcome::Failed) => true,
            // Already shown through the session's error event.
            Err(_) => false,
        }
    }

    fn drain(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    if let Err(e) = self.renderer.render(&event) {
                        warn!(error = %e, "failed to write output");
                    }
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn notice(&mut self, text: &str) {
        if let Err(e) = self.renderer.line(text) {
            warn!(error = %e, "failed to write output");
        }
    }
}
