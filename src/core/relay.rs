// src/core/relay.rs

//! Outbound byte relays shared by the PCP and Redis passthroughs.
//!
//! Bytes sent on an [`UpstreamLink`] before the dial completes are queued in
//! the link's channel and written in order once connected. Upstream EOF or
//! error closes the downstream client; closing the client ends the relay.
//!
//! Both directions are flow controlled through the client's backlogs: bytes
//! queued on the link count against its upstream backlog, and the relay
//! stops reading the upstream while the client's socket output is full.

use crate::connection::Client;
use crate::core::backlog::Backlog;
use crate::core::errors::ProxyError;
use crate::core::metrics;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const RELAY_BUF: usize = 16 * 1024;

/// Invoked on the reactor once the upstream connection is established.
pub type OnConnected = Box<dyn FnOnce(&Client) + Send>;

/// The downstream side's handle onto a relay task.
#[derive(Debug)]
pub struct UpstreamLink {
    tx: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<Backlog>,
}

impl UpstreamLink {
    pub fn send(&self, bytes: Bytes) -> Result<(), ProxyError> {
        let len = bytes.len();
        self.backlog.add(len);
        self.tx.send(bytes).map_err(|_| {
            self.backlog.sub(len);
            ProxyError::Upstream("relay has stopped".to_string())
        })
    }
}

/// Starts dialing `host:port` on behalf of `client` and returns the link
/// used to feed the upstream.
pub fn dial(
    client: &Client,
    host: String,
    port: u16,
    timeout: Duration,
    on_connected: Option<OnConnected>,
) -> UpstreamLink {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = client.upstream_backlog();
    let client = client.get();
    tokio::spawn(async move {
        run_relay(client, host, port, timeout, rx, on_connected).await;
    });
    UpstreamLink { tx, backlog }
}

async fn connect(client: &Client, host: &str, port: u16, timeout: Duration) -> Option<TcpStream> {
    let closed = client.closed_token();
    let attempt = tokio::time::timeout(timeout, TcpStream::connect((host, port)));
    let result = tokio::select! {
        _ = closed.cancelled() => return None,
        result = attempt => result,
    };
    match result {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            warn!(
                "Client {}: upstream {}:{} connect failed: {}",
                client.peer(),
                host,
                port,
                e
            );
            None
        }
        Err(_) => {
            warn!(
                "Client {}: upstream {}:{} connect timed out",
                client.peer(),
                host,
                port
            );
            None
        }
    }
}

async fn run_relay(
    client: Client,
    host: String,
    port: u16,
    timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    on_connected: Option<OnConnected>,
) {
    let Some(stream) = connect(&client, &host, port, timeout).await else {
        if client.is_open() {
            metrics::UPSTREAM_FAILURES_TOTAL.inc();
        }
        client.close();
        return;
    };
    debug!("Client {}: upstream {}:{} connected", client.peer(), host, port);
    if let Some(on_connected) = on_connected {
        on_connected(&client);
    }

    let _ = stream.set_nodelay(true);
    let (mut upstream_rd, mut upstream_wr) = stream.into_split();
    let closed = client.closed_token();
    let backlog = client.upstream_backlog();
    let mut buf = BytesMut::with_capacity(RELAY_BUF);

    loop {
        let paused = client.is_outbound_full();
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            msg = rx.recv() => {
                let Some(bytes) = msg else { break };
                // An upstream that stops reading must not hold the relay past close.
                let written = tokio::select! {
                    _ = closed.cancelled() => break,
                    written = upstream_wr.write_all(&bytes) => written,
                };
                if let Err(e) = written {
                    debug!("Client {}: upstream write failed: {}", client.peer(), e);
                    break;
                }
                backlog.sub(bytes.len());
                metrics::RELAY_BYTES_TOTAL
                    .with_label_values(&["upstream"])
                    .inc_by(bytes.len() as f64);
            }
            _ = client.outbound_ready(), if paused => {}
            read = upstream_rd.read_buf(&mut buf), if !paused => {
                match read {
                    Ok(0) => {
                        debug!("Client {}: upstream closed", client.peer());
                        break;
                    }
                    Ok(n) => {
                        let chunk = buf.split().freeze();
                        if client.write([chunk]).is_err() {
                            break;
                        }
                        metrics::RELAY_BYTES_TOTAL
                            .with_label_values(&["downstream"])
                            .inc_by(n as f64);
                        buf.reserve(RELAY_BUF);
                    }
                    Err(e) => {
                        debug!("Client {}: upstream read failed: {}", client.peer(), e);
                        break;
                    }
                }
            }
        }
    }

    let _ = upstream_wr.shutdown().await;
    client.close();
}
