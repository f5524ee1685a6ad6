// tests/integration/backpressure_test.rs

//! Flow control between a connection and its upstream relay.

use bytes::Bytes;
use pmproxy::config::Config;
use pmproxy::connection::{Client, ConnectionHandler, run_writer};
use pmproxy::core::backlog::HIGH_WATER;
use pmproxy::core::{Proxy, relay};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};

fn new_client(config: Config) -> (Client, mpsc::UnboundedReceiver<Bytes>) {
    let proxy = Arc::new(Proxy::new(Arc::new(config), None));
    let (tx, rx) = mpsc::unbounded_channel();
    (Client::new(proxy, "127.0.0.1:5000".to_string(), tx), rx)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_relay_stops_reading_upstream_while_client_output_is_full() {
    const TOTAL: usize = 16 * 1024 * 1024;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let block = vec![b'x'; 64 * 1024];
        let mut sent = 0;
        while sent < TOTAL {
            stream.write_all(&block).await.unwrap();
            sent += block.len();
        }
    });

    let (client, rx) = new_client(Config::default());
    let (mut ours, theirs) = tokio::io::duplex(64 * 1024);
    let writer = tokio::spawn(run_writer(client.get(), theirs, rx));
    let _link = relay::dial(
        &client,
        "127.0.0.1".to_string(),
        port,
        Duration::from_secs(5),
        None,
    );

    // Nothing reads the client side yet, so output piles up to high water
    // and the relay stops there.
    wait_until(|| client.is_outbound_full()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued = client.outbound_queued();
    assert!(queued < HIGH_WATER + 256 * 1024, "queued {queued} bytes");

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), ours.read_to_end(&mut received))
        .await
        .expect("relay did not resume")
        .unwrap();
    assert_eq!(received.len(), TOTAL);
    assert!(received.iter().all(|&b| b == b'x'));
    writer.await.unwrap();
}

fn set_command(value_len: usize) -> Vec<u8> {
    let mut frame = format!("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n${value_len}\r\n").into_bytes();
    frame.extend(std::iter::repeat_n(b'v', value_len));
    frame.extend_from_slice(b"\r\n");
    frame
}

#[tokio::test]
async fn test_reads_pause_while_upstream_is_not_reading() {
    const TOTAL: usize = 256 * 1024 * 1024;

    // An upstream that accepts and then never reads.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (release, held) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = held.await;
        drop(stream);
    });

    let config = Config::from_toml(&format!(
        "[listen]\naddresses = [\"127.0.0.1\"]\n[redis]\nupstream = \"127.0.0.1:{port}\"\n"
    ))
    .unwrap();
    let (client, rx) = new_client(config);
    let (mut ours, theirs) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(theirs);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let writer = tokio::spawn(run_writer(client.get(), writer, rx));
    let handler = tokio::spawn(ConnectionHandler::new(reader, client.get(), shutdown_rx).run());

    let frame = set_command(64 * 1024);
    let flood = tokio::time::timeout(Duration::from_secs(3), async {
        let mut sent = 0;
        while sent < TOTAL {
            ours.write_all(&frame).await.unwrap();
            sent += frame.len();
        }
    })
    .await;
    assert!(flood.is_err(), "the proxy kept reading");

    assert!(client.is_backlogged());
    let queued = client.upstream_queued();
    assert!(queued >= HIGH_WATER);
    assert!(queued < HIGH_WATER + 512 * 1024, "queued {queued} bytes");

    client.close();
    handler.await.unwrap();
    writer.await.unwrap();
    let _ = release.send(());
}
