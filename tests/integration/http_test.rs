// tests/integration/http_test.rs

//! HTTP framing, routing, keep-alive and worker-thread replies.

use super::test_helpers::{
    TestServer, loopback_config, read_chunked_response, read_http_head, read_http_response,
    read_to_end,
};
use bytes::Bytes;
use pmproxy::connection::Client;
use pmproxy::core::ProxyError;
use pmproxy::http::response::{self, ContentType};
use pmproxy::http::{HttpRequest, Servlet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;

/// Echoes the request body back from a worker thread.
#[derive(Default)]
struct EchoServlet {
    released: AtomicUsize,
}

impl Servlet for EchoServlet {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_url(&self, _client: &Client, request: &mut HttpRequest) -> bool {
        request.path.starts_with("/echo")
    }

    fn on_headers(&self, _client: &Client, request: &mut HttpRequest) -> Result<(), ProxyError> {
        request.data = Some(Box::new(Vec::<u8>::new()));
        Ok(())
    }

    fn on_body(
        &self,
        _client: &Client,
        request: &mut HttpRequest,
        chunk: &[u8],
    ) -> Result<(), ProxyError> {
        if let Some(body) = request
            .data
            .as_mut()
            .and_then(|d| d.downcast_mut::<Vec<u8>>())
        {
            body.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn on_done(&self, client: &Client, request: &mut HttpRequest) -> Result<(), ProxyError> {
        let mut body = request
            .data
            .take()
            .and_then(|d| d.downcast::<Vec<u8>>().ok())
            .map(|b| *b)
            .unwrap_or_default();
        if let Some(suffix) = request.parameter("suffix") {
            body.extend_from_slice(suffix.as_bytes());
        }
        let buffers = response::render(request, 200, ContentType::Text, Bytes::from(body));
        let close = !request.keep_alive;
        let client = client.get();
        std::thread::spawn(move || {
            let _ = client.proxy().reply_from_worker(&client, buffers, close);
            client.put();
        });
        Ok(())
    }

    fn on_release(&self, _client_id: u64, _request: &mut HttpRequest) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Produces `?pieces=N` lines of output through `response::append`.
struct StreamServlet;

impl Servlet for StreamServlet {
    fn name(&self) -> &str {
        "stream"
    }

    fn on_url(&self, _client: &Client, request: &mut HttpRequest) -> bool {
        request.path == "/stream"
    }

    fn on_done(&self, client: &Client, request: &mut HttpRequest) -> Result<(), ProxyError> {
        let pieces: usize = request
            .parameter("pieces")
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        for i in 0..pieces {
            let line = format!("line {i:04} of the streamed result\n");
            response::append(client, request, ContentType::Text, line.as_bytes())?;
        }
        response::reply(client, request, 200, ContentType::Text, Bytes::from_static(b"end\n"))
    }
}

fn streamed_body(pieces: usize) -> Vec<u8> {
    let mut body: Vec<u8> = (0..pieces)
        .flat_map(|i| format!("line {i:04} of the streamed result\n").into_bytes())
        .collect();
    body.extend_from_slice(b"end\n");
    body
}

#[tokio::test]
async fn test_metrics_servlet() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Connection"), Some("Keep-Alive"));
    assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
    assert!(String::from_utf8_lossy(&response.body).contains("pmproxy_classified_total"));

    server.stop().await;
}

#[tokio::test]
async fn test_metrics_servlet_rejects_post() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"POST /metrics HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 405);
    assert!(String::from_utf8_lossy(&response.body).contains("metrics servlet"));

    server.stop().await;
}

#[tokio::test]
async fn test_unrouted_url_is_404() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"GET /nowhere HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 404);
    assert_eq!(
        response.header("Content-Type"),
        Some("text/html; charset=UTF-8")
    );
    assert!(String::from_utf8_lossy(&response.body).contains("no handler for URL"));

    server.stop().await;
}

#[tokio::test]
async fn test_pipelined_requests_on_one_connection() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"HEAD /metrics HTTP/1.1\r\n\r\nGET /nowhere HTTP/1.1\r\n\r\nGET /metrics HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let head = read_http_head(&mut stream).await;
    assert_eq!(head.status(), 200);
    assert_eq!(read_http_response(&mut stream).await.status(), 404);
    let last = read_http_response(&mut stream).await;
    assert_eq!(last.status(), 200);
    assert_eq!(last.header("Connection"), Some("close"));
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_http_1_0_closes_after_response() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream.write_all(b"GET /metrics HTTP/1.0\r\n\r\n").await.unwrap();
    let response = read_http_response(&mut stream).await;
    assert!(response.head.starts_with("HTTP/1.0 200 OK"));
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_chunked_request_is_refused() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"POST /metrics HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_http_response(&mut stream).await.status(), 501);
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_bad_url_escape_is_400() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"GET /metrics%zz HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_http_response(&mut stream).await.status(), 400);
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_header_is_431() {
    let mut config = loopback_config();
    config.http.max_header_bytes = 1024;
    let server = TestServer::start(config).await;
    let mut stream = server.connect().await;

    let mut request = b"GET /metrics HTTP/1.1\r\nX-Filler: ".to_vec();
    request.extend(std::iter::repeat_n(b'a', 2048));
    request.extend_from_slice(b"\r\n\r\n");
    stream.write_all(&request).await.unwrap();

    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 431);
    assert_eq!(response.header("Connection"), Some("close"));

    server.stop().await;
}

#[tokio::test]
async fn test_worker_thread_reply_with_body() {
    let echo = Arc::new(EchoServlet::default());
    let server = TestServer::with_servlets(loopback_config(), vec![echo.clone()]).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"PUT /echo?suffix=%21 HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    stream.write_all(b"lo").await.unwrap();

    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.body, b"hello!");

    stream
        .write_all(b"GET /echo HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 200);
    assert!(response.body.is_empty());
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
    // One release when the second request replaced the first, one at teardown.
    assert_eq!(echo.released.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_head_metrics_has_length_but_no_body() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"HEAD /metrics HTTP/1.1\r\n\r\nGET /nowhere HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let head = read_http_head(&mut stream).await;
    assert_eq!(head.status(), 200);
    let length: usize = head.header("Content-Length").unwrap().parse().unwrap();
    assert!(length > 0);
    // The next bytes on the wire are the following response.
    assert_eq!(read_http_response(&mut stream).await.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_large_result_is_streamed_in_chunks() {
    let mut config = loopback_config();
    config.http.chunk_size = 256;
    let server = TestServer::with_servlets(config, vec![Arc::new(StreamServlet)]).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"GET /stream?pieces=40 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (response, sizes) = read_chunked_response(&mut stream).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Transfer-encoding"), Some("chunked"));
    assert_eq!(response.header("Content-Length"), None);
    assert_eq!(response.body, streamed_body(40));
    assert!(sizes.len() > 1, "{sizes:?}");
    assert!(sizes[..sizes.len() - 1].iter().all(|&n| n >= 256));

    // The connection stays usable after the last chunk.
    stream
        .write_all(b"GET /stream?pieces=2 HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.body, streamed_body(2));
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_large_result_for_http_1_0_is_413() {
    let mut config = loopback_config();
    config.http.chunk_size = 256;
    let server = TestServer::with_servlets(config, vec![Arc::new(StreamServlet)]).await;
    let mut stream = server.connect().await;

    stream
        .write_all(b"GET /stream?pieces=40 HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert_eq!(response.status(), 413);
    assert!(
        String::from_utf8_lossy(&response.body)
            .contains("HTTP 1.0 request result exceeds server limits")
    );
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}
