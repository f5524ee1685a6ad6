// src/http/session.rs

//! HTTP/1.x request framing for one connection.
//!
//! Heads are parsed with `httparse`; bodies are framed by `Content-Length`.
//! Requests are pipelined: bytes after one message are parsed as the next.

use super::response;
use super::servlet::{HttpRequest, Servlet};
use super::url;
use crate::connection::Client;
use crate::core::errors::ProxyError;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Body { remaining: usize },
}

/// A request whose head has been parsed.
struct Active {
    servlet: Option<Arc<dyn Servlet>>,
    request: HttpRequest,
}

pub struct HttpSession {
    buffer: BytesMut,
    phase: Phase,
    active: Option<Active>,
    max_header_bytes: usize,
    chunk_size: usize,
}

/// Owned pieces of a parsed head.
struct Head {
    method: String,
    target: String,
    version: u8,
    headers: Vec<(String, String)>,
}

enum HeadParse {
    Partial,
    Complete(Head),
    TooLarge,
}

impl HttpSession {
    pub fn new(max_header_bytes: usize, chunk_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            phase: Phase::Head,
            active: None,
            max_header_bytes,
            chunk_size,
        }
    }

    pub fn on_data(&mut self, client: &Client, data: Bytes) -> Result<(), ProxyError> {
        self.buffer.extend_from_slice(&data);

        while client.is_open() {
            match self.phase {
                Phase::Head => {
                    if self.buffer.is_empty() {
                        break;
                    }
                    match self.parse_head()? {
                        HeadParse::Partial => break,
                        HeadParse::TooLarge => {
                            let mut request = HttpRequest {
                                version: 1,
                                ..Default::default()
                            };
                            response::error(client, &mut request, 431, None, "request header too large")?;
                            break;
                        }
                        HeadParse::Complete(head) => self.begin(client, head)?,
                    }
                }
                Phase::Body { remaining } => {
                    let take = remaining.min(self.buffer.len());
                    if take > 0 {
                        let chunk = self.buffer.split_to(take);
                        if let Some(Active {
                            servlet: Some(servlet),
                            request,
                        }) = self.active.as_mut()
                        {
                            servlet.on_body(client, request, &chunk)?;
                        }
                    }
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.phase = Phase::Body { remaining };
                        break;
                    }
                    self.phase = Phase::Head;
                    self.complete(client)?;
                }
            }
        }
        Ok(())
    }

    /// Releases the request still held by this connection.
    pub fn release(mut self, client_id: u64) {
        self.release_active(client_id);
    }

    fn parse_head(&mut self) -> Result<HeadParse, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = match req.parse(&self.buffer) {
            Ok(status) => status,
            Err(httparse::Error::TooManyHeaders) => return Ok(HeadParse::TooLarge),
            Err(e) => return Err(e.into()),
        };

        let consumed = match status {
            httparse::Status::Partial => {
                if self.buffer.len() > self.max_header_bytes {
                    return Ok(HeadParse::TooLarge);
                }
                return Ok(HeadParse::Partial);
            }
            httparse::Status::Complete(n) => n,
        };
        if consumed > self.max_header_bytes {
            return Ok(HeadParse::TooLarge);
        }

        let head = Head {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
        };
        self.buffer.advance(consumed);
        Ok(HeadParse::Complete(head))
    }

    /// Starts a new request: routes it to a servlet and moves to the body.
    fn begin(&mut self, client: &Client, head: Head) -> Result<(), ProxyError> {
        self.release_active(client.id());

        let mut request = HttpRequest {
            method: head.method,
            url: head.target,
            version: head.version,
            headers: head.headers,
            chunk_size: self.chunk_size,
            ..Default::default()
        };
        request.keep_alive = match request.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => request.version >= 1,
        };

        if request
            .header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            request.keep_alive = false;
            response::error(client, &mut request, 501, None, "chunked requests are not supported")?;
            client.close();
            return Ok(());
        }

        request.content_length = match request.header("content-length") {
            None => 0,
            Some(v) => match v.trim().parse::<usize>() {
                Ok(n) => n,
                Err(_) => {
                    request.keep_alive = false;
                    response::error(client, &mut request, 400, None, "invalid Content-Length")?;
                    client.close();
                    return Ok(());
                }
            },
        };

        match url::split_url(&request.url) {
            Ok((path, parameters)) => {
                request.path = path;
                request.parameters = parameters;
            }
            Err(e) => {
                debug!("Client {}: {}", client.peer(), e);
                request.keep_alive = false;
                response::error(client, &mut request, 400, None, "failed to decode URL")?;
                client.close();
                return Ok(());
            }
        }

        let servlet = client.proxy().servlets().route(client, &mut request);
        match &servlet {
            Some(servlet) => {
                debug!(
                    "{} servlet accepts URL {} from client {}",
                    servlet.name(),
                    request.url,
                    client.peer()
                );
                servlet.on_headers(client, &mut request)?;
            }
            None => {
                response::error(client, &mut request, 404, None, "no handler for URL")?;
            }
        }

        self.phase = Phase::Body {
            remaining: request.content_length,
        };
        self.active = Some(Active { servlet, request });
        Ok(())
    }

    fn complete(&mut self, client: &Client) -> Result<(), ProxyError> {
        if let Some(Active {
            servlet: Some(servlet),
            request,
        }) = self.active.as_mut()
        {
            servlet.on_done(client, request)?;
        }
        Ok(())
    }

    fn release_active(&mut self, client_id: u64) {
        if let Some(Active {
            servlet: Some(servlet),
            mut request,
        }) = self.active.take()
        {
            servlet.on_release(client_id, &mut request);
        }
    }
}
