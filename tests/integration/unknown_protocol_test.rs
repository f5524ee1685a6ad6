// tests/integration/unknown_protocol_test.rs

use super::test_helpers::{TestServer, loopback_config, read_to_end};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn test_unknown_first_byte_is_dropped_silently() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream.write_all(b"\x00\x01hello").await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());

    // The server keeps accepting.
    let mut other = server.connect().await;
    other.write_all(b"zzz").await.unwrap();
    assert!(read_to_end(&mut other).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_tls_without_configuration_is_dropped() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    // A TLS 1.2 ClientHello record header.
    stream.write_all(b"\x16\x03\x01\x00\x05hello").await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}
