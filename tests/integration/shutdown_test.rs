// tests/integration/shutdown_test.rs

use super::test_helpers::{TestServer, loopback_config, read_to_end};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let server = TestServer::start(loopback_config()).await;
    let addr = server.addr;

    let mut idle = server.connect().await;
    let mut http = server.connect().await;
    http.write_all(b"GET /nowhere HTTP/1.1\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop().await;

    assert!(read_to_end(&mut idle).await.is_empty());
    let rest = read_to_end(&mut http).await;
    assert!(String::from_utf8_lossy(&rest).starts_with("HTTP/1.1 404"));

    // The listener is gone.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_releases_every_client() {
    let server = TestServer::start(loopback_config()).await;
    let proxy = server.proxy.clone();

    let mut streams = Vec::new();
    for _ in 0..4 {
        let mut stream = server.connect().await;
        stream.write_all(b"GET /nowhere HTTP/1.1\r\n\r\n").await.unwrap();
        streams.push(stream);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop().await;
    assert!(proxy.pending().is_empty());
    assert_eq!(proxy.callbacks().queued(), 0);
}

#[tokio::test]
async fn test_local_socket_serves_and_is_removed_on_shutdown() {
    use pmproxy::core::Proxy;
    use pmproxy::server::{AnyListener, ServerContext, bind_local, serve_until};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;
    use tokio::sync::{broadcast, oneshot};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pmproxy.socket");
    // A stale file from an earlier run is replaced.
    std::fs::write(&path, b"stale").unwrap();
    let listener = bind_local(&path, 16).unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let ctx = ServerContext {
        proxy: Arc::new(Proxy::new(Arc::new(loopback_config()), None)),
        listeners: vec![AnyListener::Unix(listener, path.clone())],
        shutdown_tx,
    };
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(serve_until(ctx, async move {
        let _ = stopped.await;
    }));

    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream
        .write_all(b"GET /metrics HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.0 200 OK\r\n"));

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!path.exists());
}
