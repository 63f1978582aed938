//! Request/response seam between the session and the network.
//!
//! The session only ever talks to a [`ChatTransport`]; [`HttpTransport`] is
//! the reqwest-backed implementation used outside of tests.

mod http;

pub use http::HttpTransport;

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::ChatError;
use parley_config::Credentials;

/// Incremental response body.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, io::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    /// Serialized JSON body; `None` for `GET`.
    pub body: Option<String>,
    pub credentials: Credentials,
}

pub struct FetchResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Option<ByteStream>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Drain the body as text. Read failures end the drain early; whatever
    /// arrived before the failure is kept.
    pub async fn text(&mut self) -> String {
        let Some(mut body) = self.body.take() else {
            return String::new();
        };
        let mut bytes = Vec::new();
        while let Some(Ok(chunk)) = body.next().await {
            bytes.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Performs one request. Implementations return `Err` only when no response
/// was obtained at all; non-2xx statuses are ordinary responses.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ChatError>;
}
