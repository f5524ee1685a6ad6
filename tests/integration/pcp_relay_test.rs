// tests/integration/pcp_relay_test.rs

//! PCP passthrough: handshake, dial, and byte relay in both directions.

use super::test_helpers::{TestServer, loopback_config, read_exact, read_to_end, spawn_echo_upstream};
use pmproxy::core::protocol::pcp::{CLIENT_HEADER, SERVER_HEADER};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_pcp_relay_round_trip() {
    let upstream = spawn_echo_upstream().await;
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream.write_all(CLIENT_HEADER).await.unwrap();
    assert_eq!(read_exact(&mut stream, SERVER_HEADER.len()).await, SERVER_HEADER);

    let hostspec = format!("127.0.0.1 {}\n", upstream.port());
    stream.write_all(hostspec.as_bytes()).await.unwrap();
    stream.write_all(b"pdu-one").await.unwrap();
    assert_eq!(read_exact(&mut stream, 7).await, b"pdu-one");

    stream.write_all(b"pdu-two").await.unwrap();
    assert_eq!(read_exact(&mut stream, 7).await, b"pdu-two");

    server.stop().await;
}

#[tokio::test]
async fn test_pcp_header_in_pieces() {
    let upstream = spawn_echo_upstream().await;
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    let (first, rest) = CLIENT_HEADER.split_at(5);
    stream.write_all(first).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let mut tail = rest.to_vec();
    tail.extend_from_slice(format!("127.0.0.1 {}\nhello", upstream.port()).as_bytes());
    stream.write_all(&tail).await.unwrap();

    assert_eq!(read_exact(&mut stream, SERVER_HEADER.len()).await, SERVER_HEADER);
    assert_eq!(read_exact(&mut stream, 5).await, b"hello");

    server.stop().await;
}

#[tokio::test]
async fn test_pcp_bad_header_closes() {
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream.write_all(b"pmproxy-nonsense\n").await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_pcp_unreachable_upstream_closes() {
    // Reserve a port, then free it so nothing is listening there.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = TestServer::start(loopback_config()).await;
    let mut stream = server.connect().await;

    stream.write_all(CLIENT_HEADER).await.unwrap();
    stream
        .write_all(format!("127.0.0.1 {port}\n").as_bytes())
        .await
        .unwrap();

    // The server line arrives, then the connection is closed.
    assert_eq!(read_to_end(&mut stream).await, SERVER_HEADER);

    server.stop().await;
}

#[tokio::test]
async fn test_pcp_disabled_closes() {
    let mut config = loopback_config();
    config.pcp.enabled = false;
    let server = TestServer::start(config).await;
    let mut stream = server.connect().await;

    stream.write_all(CLIENT_HEADER).await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());

    server.stop().await;
}
