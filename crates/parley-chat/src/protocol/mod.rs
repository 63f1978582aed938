//! Streaming wire protocol.
//!
//! In `structured` mode a response body is a sequence of newline-terminated
//! `<tag>:<json>` records; in `plain` mode every chunk is assistant text.
//! [`Decoder`] turns bytes into [`StreamEvent`]s independently of how the
//! bytes were split across reads, and [`EventReader`] drives it from an async
//! body stream with cooperative cancellation.

mod decoder;
mod event;
mod reader;

pub use decoder::{parse_line, Decoder, LineDecoder, PlainDecoder};
pub use event::{
    FileData, FinishInfo, FinishReason, StepFinish, StreamEvent, ToolCallDelta, ToolCallStart,
    ToolResult, Usage,
};
pub use reader::{EventReader, ReadItem};

pub use parley_config::StreamMode;

/// Response header announcing a `structured` body.
pub const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";

/// Pick the body framing for a response. The data-stream header forces
/// `structured`; otherwise the session's configured mode applies.
pub fn mode_from_headers<'a>(
    mut headers: impl Iterator<Item = (&'a str, &'a str)>,
    configured: StreamMode,
) -> StreamMode {
    if headers.any(|(name, _)| name.eq_ignore_ascii_case(DATA_STREAM_HEADER)) {
        StreamMode::Structured
    } else {
        configured
    }
}
