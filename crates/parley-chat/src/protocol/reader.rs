use std::collections::VecDeque;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::decoder::{Decoded, Decoder};
use super::{StreamEvent, StreamMode};
use crate::error::DecodeError;
use crate::transport::ByteStream;

#[derive(Debug, Clone, PartialEq)]
pub enum ReadItem {
    Event(StreamEvent),
    /// An undecodable record; reading continues.
    Warning(DecodeError),
    /// Body exhausted.
    End,
    /// Cancelled, or the body failed mid-read.
    Aborted,
}

/// Pulls decoded events off a response body until it ends or the token fires.
pub struct EventReader {
    body: ByteStream,
    decoder: Decoder,
    queued: VecDeque<Decoded>,
    cancel: CancellationToken,
    received_any: bool,
    done: bool,
}

impl EventReader {
    pub fn new(body: ByteStream, mode: StreamMode, cancel: CancellationToken) -> Self {
        Self {
            body,
            decoder: Decoder::new(mode),
            queued: VecDeque::new(),
            cancel,
            received_any: false,
            done: false,
        }
    }

    /// Whether any body bytes arrived. A body that ends without bytes is an
    /// empty stream, not an empty message.
    pub fn received_any(&self) -> bool {
        self.received_any
    }

    pub async fn next(&mut self) -> ReadItem {
        loop {
            if self.cancel.is_cancelled() {
                return self.abort();
            }
            if let Some(decoded) = self.queued.pop_front() {
                return match decoded {
                    Ok(event) => ReadItem::Event(event),
                    Err(warning) => ReadItem::Warning(warning),
                };
            }
            if self.done {
                return ReadItem::End;
            }

            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                chunk = self.body.next() => Some(chunk),
            };
            let Some(chunk) = polled else {
                return self.abort();
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if !bytes.is_empty() {
                        self.received_any = true;
                        self.queued.extend(self.decoder.push(&bytes));
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "response body read failed");
                    return self.abort();
                }
                None => {
                    self.done = true;
                    if self.received_any {
                        self.queued.extend(self.decoder.finish());
                    }
                }
            }
        }
    }

    fn abort(&mut self) -> ReadItem {
        self.queued.clear();
        self.done = true;
        ReadItem::Aborted
    }
}
