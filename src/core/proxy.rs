// src/core/proxy.rs

//! The process-wide `Proxy`: configuration, the TLS engine factory, the
//! pending secure-write set, the callback loop and the servlet registry.

use crate::config::Config;
use crate::connection::Client;
use crate::core::callback::{Callback, CallbackLoop, CallbackMode};
use crate::core::errors::CallbackError;
use crate::core::secure::{EngineFactory, PendingWrites};
use crate::http::{MetricsServlet, Servlet, ServletRegistry};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info};

/// A response produced off the reactor, delivered through the reply callback.
pub struct WorkerReply {
    pub client: Client,
    pub buffers: Vec<Bytes>,
    /// Close the connection after writing.
    pub close: bool,
}

pub struct Proxy {
    config: Arc<Config>,
    secure: Option<Arc<dyn EngineFactory>>,
    pending: PendingWrites,
    pending_wake: Notify,
    callbacks: CallbackLoop,
    replies: Callback<WorkerReply>,
    servlets: ServletRegistry,
    next_client_id: AtomicU64,
}

impl Proxy {
    pub fn new(config: Arc<Config>, secure: Option<Arc<dyn EngineFactory>>) -> Self {
        let callbacks = CallbackLoop::new();
        let replies = callbacks.register(CallbackMode::Queued, deliver_reply);

        let mut servlets = ServletRegistry::new();
        if config.http.metrics_servlet {
            servlets.register(Arc::new(MetricsServlet));
        }

        Self {
            config,
            secure,
            pending: PendingWrites::new(),
            pending_wake: Notify::new(),
            callbacks,
            replies,
            servlets,
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Adds a servlet. Must happen before the proxy is shared.
    pub fn register_servlet(&mut self, servlet: Arc<dyn Servlet>) {
        self.servlets.register(servlet);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn secure_factory(&self) -> Option<&Arc<dyn EngineFactory>> {
        self.secure.as_ref()
    }

    pub fn pending(&self) -> &PendingWrites {
        &self.pending
    }

    pub fn callbacks(&self) -> &CallbackLoop {
        &self.callbacks
    }

    pub fn servlets(&self) -> &ServletRegistry {
        &self.servlets
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Puts `client` in the pending set and wakes the flusher.
    pub fn schedule_pending(&self, client: &Client) {
        if self.pending.insert(client) {
            debug!("Client {} has deferred secure output", client.peer());
        }
        self.pending_wake.notify_one();
    }

    /// Wakes the flusher without changing the pending set.
    pub fn request_flush(&self) {
        self.pending_wake.notify_one();
    }

    /// Runs one flush pass over the pending set. Members that are settled or
    /// closing are removed. Returns the number still pending.
    pub fn flush_pending(&self) -> usize {
        for client in self.pending.snapshot() {
            let settled = client.flush_secure();
            if settled || !client.is_open() {
                drop(self.pending.remove(client.id()));
            }
        }
        self.pending.len()
    }

    /// Flushes the pending set each time it is signalled, until shutdown.
    pub async fn run_pending_flusher(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = self.pending_wake.notified() => {
                    let remaining = self.flush_pending();
                    if remaining > 0 {
                        debug!("{} connections still waiting on secure input", remaining);
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Hands a response built on a worker thread to the reactor.
    pub fn reply_from_worker(
        &self,
        client: &Client,
        buffers: Vec<Bytes>,
        close: bool,
    ) -> Result<(), CallbackError> {
        self.replies.fire(WorkerReply {
            client: client.get(),
            buffers,
            close,
        })
    }

    /// The final flush before sockets close. Whatever is still deferred is
    /// abandoned.
    pub fn shutdown(&self) {
        let remaining = self.flush_pending();
        let abandoned = self.pending.drain();
        self.replies.stop();
        let discarded = self.callbacks.discard_all();
        info!(
            "Proxy shut down: {} connections left with undelivered secure output, {} queued calls discarded",
            remaining.max(abandoned.len()),
            discarded
        );
    }
}

fn deliver_reply(reply: WorkerReply) {
    let WorkerReply {
        client,
        buffers,
        close,
    } = reply;
    if !client.is_open() {
        debug!("Dropping worker reply for closed client {}", client.peer());
        return;
    }
    if let Err(e) = client.write(buffers) {
        debug!("Worker reply to {} failed: {}", client.peer(), e);
    }
    if close {
        client.close();
    }
}
