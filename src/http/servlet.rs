// src/http/servlet.rs

//! The servlet boundary and the registry the HTTP session routes through.

use crate::connection::Client;
use crate::core::errors::ProxyError;
use bytes::BytesMut;
use indexmap::IndexMap;
use std::any::Any;
use std::sync::Arc;

/// One parsed HTTP request, owned by the connection until it is released.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    /// The request target exactly as sent.
    pub url: String,
    /// The decoded path component of `url`.
    pub path: String,
    /// Decoded query parameters, in the order given.
    pub parameters: IndexMap<String, String>,
    pub headers: Vec<(String, String)>,
    /// HTTP minor version (0 or 1).
    pub version: u8,
    pub keep_alive: bool,
    pub content_length: usize,
    /// Buffered response output at which `response::append` switches to
    /// chunked transfer. Zero never streams.
    pub chunk_size: usize,
    pub response: ResponseState,
    /// Servlet-private data attached to this request.
    pub data: Option<Box<dyn Any + Send>>,
}

impl HttpRequest {
    /// Case-insensitive header lookup; returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Progress of the response to one request.
#[derive(Debug, Default)]
pub struct ResponseState {
    /// Body output appended but not yet sent.
    pub(crate) pending: BytesMut,
    /// The chunked header has gone out; the rest of the body goes as chunks.
    pub(crate) streaming: bool,
    /// The response is complete. Later output for this request is dropped.
    pub(crate) sent: bool,
}

impl ResponseState {
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// A pluggable request handler. The core calls these at parser milestones
/// and never looks at the payloads.
pub trait Servlet: Send + Sync {
    fn name(&self) -> &str;

    /// Claims the request by returning true.
    fn on_url(&self, client: &Client, request: &mut HttpRequest) -> bool;

    fn on_headers(&self, _client: &Client, _request: &mut HttpRequest) -> Result<(), ProxyError> {
        Ok(())
    }

    fn on_body(
        &self,
        _client: &Client,
        _request: &mut HttpRequest,
        _chunk: &[u8],
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    /// The complete message has arrived.
    fn on_done(&self, client: &Client, request: &mut HttpRequest) -> Result<(), ProxyError>;

    /// The request is being discarded, either replaced by the next request on
    /// the connection or at connection teardown.
    fn on_release(&self, _client_id: u64, _request: &mut HttpRequest) {}
}

/// Servlets in registration order; the first to claim a URL wins.
#[derive(Clone, Default)]
pub struct ServletRegistry {
    servlets: Vec<Arc<dyn Servlet>>,
}

impl ServletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a servlet. Registering the same servlet twice has no effect.
    pub fn register(&mut self, servlet: Arc<dyn Servlet>) -> bool {
        if self.servlets.iter().any(|s| Arc::ptr_eq(s, &servlet)) {
            return false;
        }
        self.servlets.push(servlet);
        true
    }

    pub fn len(&self) -> usize {
        self.servlets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servlets.is_empty()
    }

    pub fn route(&self, client: &Client, request: &mut HttpRequest) -> Option<Arc<dyn Servlet>> {
        self.servlets
            .iter()
            .find(|s| s.on_url(client, request))
            .cloned()
    }
}
