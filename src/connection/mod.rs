// src/connection/mod.rs

//! Manages the lifecycle of accepted connections: the counted `Client`
//! record, its per-protocol state, and the read/write tasks bound to it.

mod client;
mod guard;
mod handler;
mod state;

pub use client::Client;
pub use guard::ConnectionGuard;
pub use handler::{ConnectionHandler, on_client_read, run_writer};
pub use state::{PcpSession, ProtocolState, RedisSession};

use crate::core::proxy::Proxy;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Binds a read task and a write task to a freshly accepted stream and
/// returns the connection record.
pub fn spawn<S>(
    proxy: Arc<Proxy>,
    stream: S,
    peer: String,
    shutdown_rx: broadcast::Receiver<()>,
    tasks: &mut JoinSet<()>,
) -> Client
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let client = Client::new(proxy, peer, tx);
    let (reader, writer) = tokio::io::split(stream);

    tasks.spawn(run_writer(client.get(), writer, rx));
    let handler = ConnectionHandler::new(reader, client.get(), shutdown_rx);
    tasks.spawn(handler.run());
    client
}
