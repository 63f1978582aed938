//! parley: terminal client for streaming chat endpoints.
//!
//! Sends a prompt (or runs an interactive loop reading stdin), renders the
//! streamed answer as it arrives, and prints tool invocations, data records,
//! finish reasons and token usage. Ctrl-C stops the exchange in flight.

mod render;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use parley_chat::{ChatSession, SessionOptions, StreamMode};
use parley_config::{LogLevel, ParleyConfig};
use tracing_subscriber::EnvFilter;

use crate::repl::Repl;

#[derive(Parser)]
#[command(name = "parley", about = "Chat with a streaming chat endpoint")]
struct Args {
    /// Config file. Defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chat endpoint, overriding the config.
    #[arg(long)]
    api: Option<String>,

    /// Conversation id sent with every request.
    #[arg(long)]
    id: Option<String>,

    /// Maximum consecutive assistant steps for tool continuation.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Treat response bodies as raw text instead of data-stream records.
    #[arg(long)]
    plain: bool,

    /// Reattach to the stream the server is producing for `--id` first.
    #[arg(long)]
    resume: bool,

    /// Log level for parley's own crates (overridden by RUST_LOG).
    #[arg(long, value_enum)]
    log_level: Option<LevelArg>,

    /// Prompt to send. Without one, prompts are read from stdin.
    prompt: Vec<String>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LevelArg> for LogLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Trace => LogLevel::Trace,
            LevelArg::Debug => LogLevel::Debug,
            LevelArg::Info => LogLevel::Info,
            LevelArg::Warn => LogLevel::Warn,
            LevelArg::Error => LogLevel::Error,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> ParleyConfig {
    let loaded = match path {
        Some(path) => parley_config::toml_loader::load_from_path(path),
        None => parley_config::toml_loader::load_default(),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("parley: {e}; using default settings");
        ParleyConfig::default()
    })
}

fn session_options(args: &Args, config: &ParleyConfig) -> SessionOptions {
    let mut options = SessionOptions::from_config(config);
    if let Some(api) = &args.api {
        options.api = api.clone();
    }
    if let Some(id) = &args.id {
        options = options.with_id(id.as_str());
    }
    if let Some(max_steps) = args.max_steps {
        options = options.with_max_steps(max_steps.clamp(1, 100));
    }
    if args.plain {
        options = options.with_stream_mode(StreamMode::Plain);
    }
    options
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut config = load_config(args.config.as_ref());
    if let Some(level) = args.log_level {
        config.logging.level = level.into();
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.directive())),
        )
        .init();

    let session = ChatSession::new(session_options(&args, &config));
    tracing::debug!(session = %session.id(), api = %session.options().api, "session ready");
    let mut repl = Repl::new(session);

    if args.resume && !repl.resume().await {
        return ExitCode::FAILURE;
    }

    if args.prompt.is_empty() {
        repl.run_stdin().await;
        ExitCode::SUCCESS
    } else if repl.send(args.prompt.join(" ")).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
