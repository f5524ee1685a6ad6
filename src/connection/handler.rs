// src/connection/handler.rs

//! The per-connection read and write tasks, and the read dispatcher that
//! classifies a connection and routes its input.

use super::client::Client;
use super::guard::ConnectionGuard;
use super::state::ProtocolState;
use crate::core::errors::ProxyError;
use crate::core::metrics;
use crate::core::protocol::{Protocol, classify};
use crate::core::secure::SecureChannel;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const READ_BUF: usize = 64 * 1024;

/// Drives reads for one connection until EOF, error, close or shutdown.
pub struct ConnectionHandler<R> {
    reader: R,
    client: Client,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, client: Client, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            reader,
            client,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let _guard = ConnectionGuard::new(self.client.get());
        let closed = self.client.closed_token();
        let mut buf = BytesMut::with_capacity(READ_BUF);

        loop {
            let paused = self.client.is_backlogged();
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Connection handler for {} received shutdown signal.", self.client.peer());
                    break;
                }
                _ = closed.cancelled() => break,
                _ = self.client.read_ready(), if paused => {
                    debug!("Resuming reads from {}", self.client.peer());
                }
                read = self.reader.read_buf(&mut buf), if !paused => {
                    match read {
                        Ok(0) => {
                            debug!("Connection from {} closed by peer.", self.client.peer());
                            break;
                        }
                        Ok(_) => {
                            let data = buf.split().freeze();
                            on_client_read(&self.client, data);
                            buf.reserve(READ_BUF);
                        }
                        Err(e) => {
                            if is_normal_disconnect(&e) {
                                debug!("Connection from {} closed by peer: {}", self.client.peer(), e);
                            } else {
                                warn!("Connection error for {}: {}", self.client.peer(), e);
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Drains the connection's outbound queue into the socket, releasing the
/// written bytes from the connection's outbound backlog. After the
/// connection closes, whatever is already queued is still written before the
/// socket is shut down and this task's reference released.
pub async fn run_writer<W>(client: Client, mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    let closed = client.closed_token();
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(bytes) = msg else { break };
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!("Write to {} failed: {}", client.peer(), e);
                    client.close();
                    break;
                }
                client.outbound_written(bytes.len());
            }
            _ = closed.cancelled() => {
                while let Ok(bytes) = rx.try_recv() {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                    client.outbound_written(bytes.len());
                }
                break;
            }
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    client.put();
}

/// Handles bytes read from a connection. Any error closes the connection.
pub fn on_client_read(client: &Client, data: Bytes) {
    if let Err(e) = dispatch_read(client, data) {
        match e {
            ProxyError::UnknownProtocol(byte) => {
                metrics::UNKNOWN_PROTOCOL_TOTAL.inc();
                debug!(
                    "Dropping {}: unrecognized protocol byte 0x{:02x}",
                    client.peer(),
                    byte
                );
            }
            ProxyError::Closed => debug!("Client {} finished", client.peer()),
            e => warn!("Closing client {}: {}", client.peer(), e),
        }
        client.close();
    }
}

fn dispatch_read(client: &Client, data: Bytes) -> Result<(), ProxyError> {
    if data.is_empty() {
        return Ok(());
    }
    let protocol = client.protocol();
    if protocol.contains(Protocol::SECURE) {
        return read_secure(client, &data);
    }
    if protocol.is_empty() {
        let detected = classify(data[0]).ok_or(ProxyError::UnknownProtocol(data[0]))?;
        if detected == Protocol::SECURE {
            start_secure(client)?;
            return read_secure(client, &data);
        }
        enter_protocol(client, detected)?;
    }
    deliver(client, data)
}

fn start_secure(client: &Client) -> Result<(), ProxyError> {
    let factory = client
        .proxy()
        .secure_factory()
        .ok_or(ProxyError::TlsUnavailable)?;
    let engine = factory.create()?;
    client.tag(Protocol::SECURE)?;
    client.attach_secure(SecureChannel::new(engine));
    metrics::CLASSIFIED_TOTAL
        .with_label_values(&[Protocol::SECURE.name()])
        .inc();
    debug!("Client {} classified as secure", client.peer());
    Ok(())
}

fn read_secure(client: &Client, data: &[u8]) -> Result<(), ProxyError> {
    let outcome = client.secure_read(data)?;
    if !outcome.plaintext.is_empty() {
        deliver_plaintext(client, outcome.plaintext)?;
    }
    if outcome.peer_closed {
        return Err(ProxyError::Closed);
    }
    Ok(())
}

/// Routes decrypted input, classifying it first if this is the first
/// plaintext the connection has produced.
fn deliver_plaintext(client: &Client, plain: Bytes) -> Result<(), ProxyError> {
    if client.protocol().data().is_none() {
        let detected = classify(plain[0]).ok_or(ProxyError::UnknownProtocol(plain[0]))?;
        if detected == Protocol::SECURE {
            return Err(ProxyError::Protocol(
                "TLS record inside a secure channel".to_string(),
            ));
        }
        enter_protocol(client, detected)?;
    }
    deliver(client, plain)
}

fn enter_protocol(client: &Client, protocol: Protocol) -> Result<(), ProxyError> {
    let proxy = client.proxy();
    let enabled = if protocol == Protocol::PCP {
        proxy.config().pcp.enabled
    } else if protocol == Protocol::REDIS {
        proxy.config().redis.enabled
    } else {
        protocol == Protocol::HTTP
    };
    if !enabled {
        return Err(ProxyError::Protocol(format!(
            "{} connections are disabled",
            protocol.name()
        )));
    }

    let mask = client.tag(protocol)?;
    *client.lock_state() = ProtocolState::for_protocol(protocol, proxy);
    metrics::CLASSIFIED_TOTAL
        .with_label_values(&[protocol.name()])
        .inc();
    debug!("Client {} classified as {:?}", client.peer(), mask);
    Ok(())
}

fn deliver(client: &Client, data: Bytes) -> Result<(), ProxyError> {
    let mut state = client.lock_state();
    state.on_data(client, data)
}

/// Errors that simply mean the peer went away.
fn is_normal_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    )
}
