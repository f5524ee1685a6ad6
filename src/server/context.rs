// src/server/context.rs

use super::listener::AnyListener;
use crate::core::proxy::Proxy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything initialized before the accept loop starts.
pub struct ServerContext {
    pub proxy: Arc<Proxy>,
    pub listeners: Vec<AnyListener>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ServerContext {
    /// The bound TCP addresses, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(AnyListener::local_addr).collect()
    }

    /// Socket files to remove at shutdown.
    pub fn local_paths(&self) -> Vec<PathBuf> {
        self.listeners
            .iter()
            .filter_map(|l| match l {
                AnyListener::Unix(_, path) => Some(path.clone()),
                AnyListener::Tcp(_) => None,
            })
            .collect()
    }
}
