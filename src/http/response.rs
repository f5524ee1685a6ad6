// src/http/response.rs

//! Response rendering: status lines, the common header block and the HTML
//! error page.
//!
//! Servlets may build a body incrementally with `append`. Output stays
//! buffered on the request until it reaches the request's chunk size; past
//! that an HTTP/1.1 response switches to chunked transfer encoding, and an
//! HTTP/1.0 one is refused with 413 since it has no way to stream.

use super::servlet::HttpRequest;
use crate::connection::Client;
use crate::core::errors::ProxyError;
use crate::core::metrics;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};

const PROGRAM: &str = "pmproxy";
const VERSION: &str = env!("PMPROXY_BUILD_VERSION");

/// Ends a chunked response body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Html,
    Text,
    JavaScript,
    Css,
    Icon,
    Jpeg,
    Png,
    Gif,
    /// Prometheus text exposition format.
    Prometheus,
    Binary,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Html => "text/html",
            ContentType::Text => "text/plain",
            ContentType::JavaScript => "text/javascript",
            ContentType::Css => "text/css",
            ContentType::Icon => "image/x-icon",
            ContentType::Jpeg => "image/jpeg",
            ContentType::Png => "image/png",
            ContentType::Gif => "image/gif",
            ContentType::Prometheus => "text/plain; version=0.0.4",
            ContentType::Binary => "application/octet-stream",
        }
    }

    /// Textual types are labelled with a UTF-8 charset.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            ContentType::Json
                | ContentType::Html
                | ContentType::Text
                | ContentType::JavaScript
                | ContentType::Css
                | ContentType::Prometheus
        )
    }

    /// Maps a file suffix onto a content type.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "js" => Some(ContentType::JavaScript),
            "ico" => Some(ContentType::Icon),
            "css" => Some(ContentType::Css),
            "png" => Some(ContentType::Png),
            "gif" => Some(ContentType::Gif),
            "jpg" | "jpeg" => Some(ContentType::Jpeg),
            "html" => Some(ContentType::Html),
            "txt" => Some(ContentType::Text),
            "json" => Some(ContentType::Json),
            _ => None,
        }
    }
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Formats a timestamp as an RFC 7231 HTTP date.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Renders the status line and header block for a body of `length` bytes.
pub fn render_header(
    status: u16,
    version: u8,
    keep_alive: bool,
    content_type: ContentType,
    length: usize,
) -> Bytes {
    let mut len_buf = itoa::Buffer::new();
    let framing = format!("Content-Length: {}\r\n", len_buf.format(length));
    header_block(status, version, keep_alive, content_type, &framing)
}

/// Renders the header block of a chunked response, which carries no length.
pub fn render_chunked_header(
    status: u16,
    version: u8,
    keep_alive: bool,
    content_type: ContentType,
) -> Bytes {
    header_block(
        status,
        version,
        keep_alive,
        content_type,
        "Transfer-encoding: chunked\r\n",
    )
}

fn header_block(
    status: u16,
    version: u8,
    keep_alive: bool,
    content_type: ContentType,
    framing: &str,
) -> Bytes {
    let charset = if content_type.is_text() {
        "; charset=UTF-8"
    } else {
        ""
    };
    let connection = if keep_alive { "Keep-Alive" } else { "close" };
    let header = format!(
        "HTTP/1.{version} {status} {reason}\r\n\
         Connection: {connection}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         {framing}\
         Content-Type: {mime}{charset}\r\n\
         Date: {date}\r\n\r\n",
        reason = status_reason(status),
        mime = content_type.mime(),
        date = http_date(Utc::now()),
    );
    Bytes::from(header)
}

/// Frames `data` as one chunk: its length in hex, the data, then CRLF.
pub fn render_chunk(data: Bytes) -> [Bytes; 3] {
    [
        Bytes::from(format!("{:X}\r\n", data.len())),
        data,
        Bytes::from_static(b"\r\n"),
    ]
}

/// Renders a complete response for `request` as header and body buffers.
pub fn render(
    request: &HttpRequest,
    status: u16,
    content_type: ContentType,
    body: Bytes,
) -> Vec<Bytes> {
    let header = render_header(
        status,
        request.version,
        request.keep_alive,
        content_type,
        body.len(),
    );
    vec![header, body]
}

/// Sends a response on the reactor, after any output already appended to
/// the request. A streaming response is finished with a last chunk instead.
/// Connections that are not keep-alive are closed once the response is
/// queued.
pub fn reply(
    client: &Client,
    request: &mut HttpRequest,
    status: u16,
    content_type: ContentType,
    body: Bytes,
) -> Result<(), ProxyError> {
    if request.response.sent {
        return Ok(());
    }
    request.response.sent = true;
    metrics::HTTP_RESPONSES_TOTAL
        .with_label_values(&[itoa::Buffer::new().format(status)])
        .inc();

    let body = take_pending(request, body);
    let buffers = if request.response.streaming {
        let mut buffers = Vec::with_capacity(4);
        if !body.is_empty() {
            buffers.extend(render_chunk(body));
        }
        buffers.push(Bytes::from_static(LAST_CHUNK));
        buffers
    } else {
        render(request, status, content_type, body)
    };
    client.write(buffers)?;
    if !request.keep_alive {
        client.close();
    }
    Ok(())
}

/// Answers a HEAD request with the header block of a `length` byte body.
pub fn reply_head(
    client: &Client,
    request: &mut HttpRequest,
    status: u16,
    content_type: ContentType,
    length: usize,
) -> Result<(), ProxyError> {
    if request.response.sent {
        return Ok(());
    }
    request.response.sent = true;
    metrics::HTTP_RESPONSES_TOTAL
        .with_label_values(&[itoa::Buffer::new().format(status)])
        .inc();
    client.write([render_header(
        status,
        request.version,
        request.keep_alive,
        content_type,
        length,
    )])?;
    if !request.keep_alive {
        client.close();
    }
    Ok(())
}

/// Adds `data` to the response body. Once the buffered output reaches the
/// request's chunk size it is sent as a chunk, preceded by a 200 chunked
/// header the first time. An HTTP/1.0 request gets a 413 instead.
pub fn append(
    client: &Client,
    request: &mut HttpRequest,
    content_type: ContentType,
    data: &[u8],
) -> Result<(), ProxyError> {
    if request.response.sent {
        return Ok(());
    }
    request.response.pending.extend_from_slice(data);
    if request.chunk_size == 0 || request.response.pending.len() < request.chunk_size {
        return Ok(());
    }

    if request.version == 0 {
        return error(
            client,
            request,
            413,
            None,
            "HTTP 1.0 request result exceeds server limits",
        );
    }

    let mut buffers = Vec::with_capacity(4);
    if !request.response.streaming {
        request.response.streaming = true;
        buffers.push(render_chunked_header(
            200,
            request.version,
            request.keep_alive,
            content_type,
        ));
    }
    buffers.extend(render_chunk(request.response.pending.split().freeze()));
    client.write(buffers)
}

fn take_pending(request: &mut HttpRequest, body: Bytes) -> Bytes {
    let pending = &mut request.response.pending;
    if pending.is_empty() {
        return body;
    }
    let mut out = BytesMut::with_capacity(pending.len() + body.len());
    out.extend_from_slice(pending);
    out.extend_from_slice(&body);
    pending.clear();
    out.freeze()
}

/// The HTML body sent with error statuses.
pub fn error_page(status: u16, servlet: &str, message: &str) -> String {
    let reason = status_reason(status);
    format!(
        "<html>\r\n\
         <head><title>{status} {reason}</title></head>\r\n\
         <body>\r\n\
         <h1>{status} {reason}</h1>\r\n\
         <p><b>{servlet} servlet</b>: {message}</p><hr>\r\n\
         <p><small><i>{PROGRAM}/{VERSION}</i></small></p>\r\n\
         </body>\r\n\
         </html>\r\n"
    )
}

/// Sends an HTML error page. Output already appended to the request is
/// discarded first.
pub fn error(
    client: &Client,
    request: &mut HttpRequest,
    status: u16,
    servlet: Option<&str>,
    message: &str,
) -> Result<(), ProxyError> {
    request.response.pending.clear();
    let body = error_page(status, servlet.unwrap_or(PROGRAM), message);
    reply(client, request, status, ContentType::Html, Bytes::from(body))
}
