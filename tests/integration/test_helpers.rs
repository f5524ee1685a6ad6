// tests/integration/test_helpers.rs

//! Test helpers for running a proxy on an ephemeral loopback port.

use pmproxy::config::Config;
use pmproxy::core::Proxy;
use pmproxy::http::Servlet;
use pmproxy::server::{AnyListener, ServerContext, bind_tcp, serve_until};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A proxy serving on 127.0.0.1 until dropped or stopped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub proxy: Arc<Proxy>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(config: Config) -> Self {
        Self::with_servlets(config, Vec::new()).await
    }

    pub async fn with_servlets(config: Config, servlets: Vec<Arc<dyn Servlet>>) -> Self {
        init_tracing();

        let mut proxy = Proxy::new(Arc::new(config), None);
        for servlet in servlets {
            proxy.register_servlet(servlet);
        }
        let proxy = Arc::new(proxy);

        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let ctx = ServerContext {
            proxy: proxy.clone(),
            listeners: vec![AnyListener::Tcp(listener)],
            shutdown_tx,
        };
        let addr = ctx.local_addrs()[0];

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve_until(ctx, async move {
            let _ = stopped.await;
        }));

        Self {
            addr,
            proxy,
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Signals shutdown and waits for the server to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(15), handle)
                .await
                .expect("server should shut down")
                .unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// A config listening only on loopback.
pub fn loopback_config() -> Config {
    Config::from_toml("[listen]\naddresses = [\"127.0.0.1\"]\n").unwrap()
}

/// An upstream that echoes everything back to the sender.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Reads exactly `len` bytes.
pub async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Reads until the peer closes the connection.
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// One HTTP response: status line plus headers, and the body.
pub struct HttpResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        self.head
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

/// Reads a status line and header block, leaving any body unread.
pub async fn read_http_head(stream: &mut TcpStream) -> HttpResponse {
    let head = read_line_until(stream, b"\r\n\r\n").await;
    HttpResponse {
        head,
        body: Vec::new(),
    }
}

/// Reads one Content-Length framed HTTP response.
pub async fn read_http_response(stream: &mut TcpStream) -> HttpResponse {
    let mut response = read_http_head(stream).await;
    let len = response
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    response.body = read_exact(stream, len).await;
    response
}

/// Reads one chunked HTTP response, returning the decoded body and the
/// size of every data chunk in order.
pub async fn read_chunked_response(stream: &mut TcpStream) -> (HttpResponse, Vec<usize>) {
    let mut response = read_http_head(stream).await;
    let mut sizes = Vec::new();
    loop {
        let line = read_line_until(stream, b"\r\n").await;
        let size = usize::from_str_radix(line.trim_end(), 16).unwrap();
        if size == 0 {
            assert_eq!(read_exact(stream, 2).await, b"\r\n");
            break;
        }
        sizes.push(size);
        response.body.extend(read_exact(stream, size).await);
        assert_eq!(read_exact(stream, 2).await, b"\r\n");
    }
    (response, sizes)
}

async fn read_line_until(stream: &mut TcpStream, end: &[u8]) -> String {
    let mut line = Vec::new();
    while !line.ends_with(end) {
        let byte = read_exact(stream, 1).await;
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}
