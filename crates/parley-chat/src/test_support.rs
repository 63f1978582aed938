//! Scripted transport for session tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ChatError;
use crate::protocol::DATA_STREAM_HEADER;
use crate::reconciler::IdGenerator;
use crate::transport::{ByteStream, ChatTransport, FetchRequest, FetchResponse};

/// Canned response replayed by [`ScriptedTransport`].
pub(crate) struct ScriptedResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    chunks: Vec<Vec<u8>>,
    /// Chunks released only after the gate fires.
    gated: Option<(oneshot::Receiver<()>, Vec<Vec<u8>>)>,
    stall: bool,
    has_body: bool,
    hang: bool,
}

impl ScriptedResponse {
    fn new(status: u16, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            chunks,
            gated: None,
            stall: false,
            has_body: true,
            hang: false,
        }
    }

    /// Structured body, one record per chunk, announced by header.
    pub fn stream(lines: &[&str]) -> Self {
        let mut response = Self::new(200, lines_to_chunks(lines));
        response
            .headers
            .insert(DATA_STREAM_HEADER.to_string(), "v1".to_string());
        response
    }

    /// Plain-text body with no data-stream header.
    pub fn plain(chunks: &[&str]) -> Self {
        Self::new(200, chunks.iter().map(|c| c.as_bytes().to_vec()).collect())
    }

    pub fn status(status: u16, body: &str) -> Self {
        let chunks = if body.is_empty() {
            Vec::new()
        } else {
            vec![body.as_bytes().to_vec()]
        };
        Self::new(status, chunks)
    }

    /// Successful response that carries no body at all.
    pub fn without_body() -> Self {
        let mut response = Self::new(200, Vec::new());
        response.has_body = false;
        response
    }

    /// The fetch itself never completes.
    pub fn hang() -> Self {
        let mut response = Self::new(200, Vec::new());
        response.hang = true;
        response
    }

    /// Keep the body open after the scripted chunks.
    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Hold `lines` back until `gate` fires.
    pub fn then_after(mut self, gate: oneshot::Receiver<()>, lines: &[&str]) -> Self {
        self.gated = Some((gate, lines_to_chunks(lines)));
        self
    }

    /// Re-split the body into chunks of `size` bytes.
    pub fn rechunk(mut self, size: usize) -> Self {
        let bytes: Vec<u8> = self.chunks.concat();
        self.chunks = bytes.chunks(size.max(1)).map(<[u8]>::to_vec).collect();
        self
    }

    fn into_response(self) -> FetchResponse {
        let head: ByteStream = stream::iter(self.chunks.into_iter().map(Ok)).boxed();
        let body = match self.gated {
            Some((gate, tail)) => head
                .chain(
                    stream::once(async move {
                        let _ = gate.await;
                        stream::iter(tail.into_iter().map(Ok))
                    })
                    .flatten(),
                )
                .boxed(),
            None => head,
        };
        let body = if self.stall {
            body.chain(stream::pending()).boxed()
        } else {
            body
        };
        FetchResponse {
            status: self.status,
            headers: self.headers,
            body: self.has_body.then_some(body),
        }
    }
}

fn lines_to_chunks(lines: &[&str]) -> Vec<Vec<u8>> {
    lines
        .iter()
        .map(|line| format!("{line}\n").into_bytes())
        .collect()
}

/// Replays scripted responses in order and records every request.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<ScriptedResponse, ChatError>>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<ScriptedResponse>) -> Arc<Self> {
        let transport = Self::default();
        transport
            .responses
            .lock()
            .unwrap()
            .extend(responses.into_iter().map(Ok));
        Arc::new(transport)
    }

    pub fn failing(error: ChatError) -> Arc<Self> {
        let transport = Self::default();
        transport.responses.lock().unwrap().push_back(Err(error));
        Arc::new(transport)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// JSON bodies of the recorded requests, in order.
    pub fn bodies(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .filter_map(|request| request.body.as_deref())
            .map(|body| serde_json::from_str(body).unwrap())
            .collect()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ChatError> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) if response.hang => std::future::pending().await,
            Some(Ok(response)) => Ok(response.into_response()),
            Some(Err(error)) => Err(error),
            None => Err(ChatError::network("no scripted response left")),
        }
    }
}

/// Deterministic ids: `id-0`, `id-1`, ...
pub(crate) fn sequential_ids() -> IdGenerator {
    let next = Arc::new(AtomicUsize::new(0));
    Arc::new(move || format!("id-{}", next.fetch_add(1, Ordering::SeqCst)))
}
