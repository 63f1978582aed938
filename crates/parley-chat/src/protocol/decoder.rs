use serde::de::DeserializeOwned;
use serde_json::Value;

use super::event::{
    FileData, FinishInfo, FinishReason, StepFinish, StepStartPayload, StreamEvent, ToolCallDelta,
    ToolCallStart, ToolResult,
};
use super::StreamMode;
use crate::error::DecodeError;
use crate::message::{Source, ToolCall};

pub type Decoded = Result<StreamEvent, DecodeError>;

/// Parse one structured-mode record (without its trailing newline).
pub fn parse_line(line: &str) -> Decoded {
    let Some((tag, payload)) = line.split_once(':') else {
        return Err(DecodeError::MissingSeparator {
            line: line.to_string(),
        });
    };

    let event = match tag {
        "0" => StreamEvent::TextDelta(payload_as(tag, payload)?),
        "g" => StreamEvent::ReasoningDelta(payload_as(tag, payload)?),
        "2" => StreamEvent::DataDelta(payload_as::<Vec<Value>>(tag, payload)?),
        "8" => StreamEvent::MessageAnnotations(payload_as::<Vec<Value>>(tag, payload)?),
        "3" => StreamEvent::Error(payload_as(tag, payload)?),
        "9" => StreamEvent::ToolCall(payload_as::<ToolCall>(tag, payload)?),
        "a" => StreamEvent::ToolResult(payload_as::<ToolResult>(tag, payload)?),
        "b" => StreamEvent::ToolCallStreamStart(payload_as::<ToolCallStart>(tag, payload)?),
        "c" => StreamEvent::ToolCallArgDelta(payload_as::<ToolCallDelta>(tag, payload)?),
        "d" => StreamEvent::MessageFinish(payload_as::<FinishInfo>(tag, payload)?),
        "e" => StreamEvent::StepFinish(payload_as::<StepFinish>(tag, payload)?),
        "f" => {
            let start: StepStartPayload = payload_as(tag, payload)?;
            StreamEvent::StepStart {
                message_id: start.message_id,
            }
        }
        "h" => StreamEvent::Source(payload_as::<Source>(tag, payload)?),
        "k" => StreamEvent::File(payload_as::<FileData>(tag, payload)?),
        _ => {
            return Err(DecodeError::UnknownTag {
                tag: tag.to_string(),
            })
        }
    };
    Ok(event)
}

fn payload_as<T: DeserializeOwned>(tag: &str, payload: &str) -> Result<T, DecodeError> {
    serde_json::from_str(payload).map_err(|e| DecodeError::InvalidPayload {
        tag: tag.to_string(),
        message: e.to_string(),
    })
}

/// Splits a structured body into records. Records may straddle chunk
/// boundaries; the decoder buffers until a newline arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            if let Some(decoded) = decode_line(&self.buffer[start..end]) {
                out.push(decoded);
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        out
    }

    /// End of body. A non-blank unterminated tail is reported, never parsed.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let tail = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if tail.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            vec![Err(DecodeError::TruncatedLine { len: tail.len() })]
        }
    }
}

fn decode_line(raw: &[u8]) -> Option<Decoded> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(match std::str::from_utf8(raw) {
        Ok(line) => parse_line(line),
        Err(_) => Err(DecodeError::InvalidUtf8),
    })
}

/// Treats every byte of the body as assistant text.
#[derive(Debug, Default)]
pub struct PlainDecoder {
    /// Leading bytes of a multi-byte character split across chunks.
    pending: Vec<u8>,
}

impl PlainDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        if text.is_empty() {
            Vec::new()
        } else {
            vec![Ok(StreamEvent::TextDelta(text))]
        }
    }

    /// End of body: flush leftovers and close the message, since plain
    /// bodies carry no finish record of their own.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            out.push(Ok(StreamEvent::TextDelta(tail)));
        }
        out.push(Ok(StreamEvent::MessageFinish(FinishInfo {
            finish_reason: FinishReason::Unknown,
            usage: None,
        })));
        out
    }
}

#[derive(Debug)]
pub enum Decoder {
    Structured(LineDecoder),
    Plain(PlainDecoder),
}

impl Decoder {
    pub fn new(mode: StreamMode) -> Self {
        match mode {
            StreamMode::Structured => Self::Structured(LineDecoder::new()),
            StreamMode::Plain => Self::Plain(PlainDecoder::new()),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        match self {
            Self::Structured(decoder) => decoder.push(chunk),
            Self::Plain(decoder) => decoder.push(chunk),
        }
    }

    pub fn finish(&mut self) -> Vec<Decoded> {
        match self {
            Self::Structured(decoder) => decoder.finish(),
            Self::Plain(decoder) => decoder.finish(),
        }
    }
}
