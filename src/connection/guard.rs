// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard that closes a connection when
//! its read task exits, whatever the reason.

use super::client::Client;
use crate::core::metrics;
use tracing::debug;

pub struct ConnectionGuard {
    client: Client,
}

impl ConnectionGuard {
    pub(crate) fn new(client: Client) -> Self {
        metrics::CONNECTED_CLIENTS.inc();
        Self { client }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(
            "ConnectionGuard dropping for client {} ({}), refcount {}",
            self.client.id(),
            self.client.peer(),
            self.client.refcount()
        );
        self.client.close();
    }
}
