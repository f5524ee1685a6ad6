// src/connection/client.rs

//! The connection record shared by every task that works on one accepted
//! stream.
//!
//! `Client` is a counted handle: `get` takes another reference and `put`
//! releases one. Protocol teardown runs exactly once, when the last
//! reference goes away, and never while any holder (read task, write task,
//! relay, pending set, queued worker reply) still has the record.

use super::state::ProtocolState;
use crate::core::backlog::Backlog;
use crate::core::errors::ProxyError;
use crate::core::metrics;
use crate::core::protocol::Protocol;
use crate::core::proxy::Proxy;
use crate::core::secure::{ReadOutcome, SecureChannel};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: u64,
    peer: String,
    proxy: Arc<Proxy>,
    open: AtomicBool,
    protocol: AtomicU8,
    state: Mutex<ProtocolState>,
    secure: Mutex<Option<SecureChannel>>,
    /// Ordered socket output, drained by the connection's write task.
    outbound: mpsc::UnboundedSender<Bytes>,
    /// Bytes in `outbound` not yet written to the socket.
    outbound_backlog: Backlog,
    /// Bytes read from this connection and queued for an upstream relay.
    upstream_backlog: Arc<Backlog>,
    closed: CancellationToken,
}

enum Route {
    Plain(Vec<Bytes>),
    /// A failed write carries the alert the engine queued for the peer.
    Secure(Result<crate::core::secure::WriteOutcome, (ProxyError, Bytes)>),
}

impl Client {
    /// Creates a new open record holding one reference.
    pub fn new(proxy: Arc<Proxy>, peer: String, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        let id = proxy.next_client_id();
        Self {
            inner: Arc::new(ClientInner {
                id,
                peer,
                proxy,
                open: AtomicBool::new(true),
                protocol: AtomicU8::new(0),
                state: Mutex::new(ProtocolState::Unknown),
                secure: Mutex::new(None),
                outbound,
                outbound_backlog: Backlog::default(),
                upstream_backlog: Arc::new(Backlog::default()),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Takes another reference to this connection.
    pub fn get(&self) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Releases this reference. The last release tears the connection down.
    pub fn put(self) {
        drop(self);
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.inner.proxy
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_bits_truncate(self.inner.protocol.load(Ordering::Acquire))
    }

    /// ORs a protocol bit into the mask. Fails once a data-carrying protocol
    /// is already set, or when SECURE would be applied twice.
    pub fn tag(&self, bit: Protocol) -> Result<Protocol, ProxyError> {
        let previous = self
            .inner
            .protocol
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = Protocol::from_bits_truncate(bits);
                if current.data().is_some() || current.intersects(bit) {
                    return None;
                }
                Some((current | bit).bits())
            })
            .map_err(|bits| {
                ProxyError::Protocol(format!(
                    "cannot tag {} connection as {}",
                    Protocol::from_bits_truncate(bits).name(),
                    bit.name()
                ))
            })?;
        Ok(Protocol::from_bits_truncate(previous) | bit)
    }

    /// Locks the per-protocol state.
    pub fn lock_state(&self) -> MutexGuard<'_, ProtocolState> {
        self.inner.state.lock()
    }

    pub fn attach_secure(&self, channel: SecureChannel) {
        *self.inner.secure.lock() = Some(channel);
    }

    pub fn is_secure(&self) -> bool {
        self.inner.secure.lock().is_some()
    }

    /// Number of secure write buffers waiting for a read.
    pub fn deferred_writes(&self) -> usize {
        self.inner
            .secure
            .lock()
            .as_ref()
            .map_or(0, SecureChannel::deferred_len)
    }

    /// Marks the connection closed. Only the first call has any effect: it
    /// wakes every task bound to the connection and drops it from the pending
    /// set. The write task drains queued output, shuts the socket down and
    /// releases its reference.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            debug!("Closing client {} ({})", self.inner.id, self.inner.peer);
            self.inner.closed.cancel();
            drop(self.inner.proxy.pending().remove(self.inner.id));
        }
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Bytes queued for the socket and not yet written.
    pub fn outbound_queued(&self) -> usize {
        self.inner.outbound_backlog.queued()
    }

    /// Bytes read from this connection and not yet written upstream.
    pub fn upstream_queued(&self) -> usize {
        self.inner.upstream_backlog.queued()
    }

    /// Whether reads from the socket should pause until a queue they feed
    /// has drained.
    pub fn is_backlogged(&self) -> bool {
        self.inner.outbound_backlog.is_full() || self.inner.upstream_backlog.is_full()
    }

    /// Waits until both queues fed by this connection's reads have room.
    pub async fn read_ready(&self) {
        self.inner.outbound_backlog.wait_for_room().await;
        self.inner.upstream_backlog.wait_for_room().await;
    }

    /// Waits until the socket output queue has room.
    pub async fn outbound_ready(&self) {
        self.inner.outbound_backlog.wait_for_room().await;
    }

    pub fn is_outbound_full(&self) -> bool {
        self.inner.outbound_backlog.is_full()
    }

    /// Records that the write task has written `bytes` to the socket.
    pub(crate) fn outbound_written(&self, bytes: usize) {
        self.inner.outbound_backlog.sub(bytes);
    }

    pub(crate) fn upstream_backlog(&self) -> Arc<Backlog> {
        Arc::clone(&self.inner.upstream_backlog)
    }

    /// Writes buffers to the connection in order, through the secure channel
    /// when one is attached.
    pub fn write<I>(&self, buffers: I) -> Result<(), ProxyError>
    where
        I: IntoIterator<Item = Bytes>,
    {
        if !self.is_open() {
            return Err(ProxyError::Closed);
        }
        let buffers: Vec<Bytes> = buffers.into_iter().filter(|b| !b.is_empty()).collect();
        if buffers.is_empty() {
            return Ok(());
        }

        let route = {
            let mut secure = self.inner.secure.lock();
            match secure.as_mut() {
                Some(channel) => Route::Secure(
                    channel
                        .write(buffers)
                        .map_err(|e| (e, channel.take_alert())),
                ),
                None => Route::Plain(buffers),
            }
        };

        match route {
            Route::Plain(buffers) => {
                for buf in buffers {
                    self.send_raw(buf)?;
                }
                Ok(())
            }
            Route::Secure(Ok(outcome)) => {
                self.send_raw(outcome.ciphertext)?;
                if outcome.deferred {
                    self.inner.proxy.schedule_pending(self);
                }
                Ok(())
            }
            Route::Secure(Err((e, alert))) => {
                metrics::SECURE_ERRORS_TOTAL.inc();
                warn!("Secure write failed for client {}: {}", self.inner.peer, e);
                let _ = self.send_raw(alert);
                self.close();
                Err(e)
            }
        }
    }

    /// Feeds ciphertext read from the socket into the secure channel and
    /// sends any engine output. Returns the decrypted outcome.
    ///
    /// When the engine rejects the input, the alert it queued is still sent
    /// so the write task delivers it ahead of the shutdown.
    pub(crate) fn secure_read(&self, data: &[u8]) -> Result<ReadOutcome, ProxyError> {
        let result = {
            let mut secure = self.inner.secure.lock();
            match secure.as_mut() {
                Some(channel) => channel.on_read(data).map_err(|e| (e, channel.take_alert())),
                None => return Err(ProxyError::Internal("no secure channel".to_string())),
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err((e, alert)) => {
                metrics::SECURE_ERRORS_TOTAL.inc();
                let _ = self.send_raw(alert);
                return Err(e);
            }
        };

        self.send_raw(outcome.ciphertext.clone())?;
        let proxy = &self.inner.proxy;
        if outcome.want_read {
            proxy.schedule_pending(self);
        } else if proxy.pending().contains(self.inner.id) {
            proxy.request_flush();
        }
        Ok(outcome)
    }

    /// Retries deferred secure writes and sends engine output. Returns true
    /// once nothing remains to deliver, or the connection is gone.
    pub(crate) fn flush_secure(&self) -> bool {
        if !self.is_open() {
            return true;
        }
        let result = {
            let mut secure = self.inner.secure.lock();
            match secure.as_mut() {
                Some(channel) => channel.flush().map_err(|e| (e, channel.take_alert())),
                None => return true,
            }
        };
        match result {
            Ok(outcome) => {
                if self.send_raw(outcome.ciphertext).is_err() {
                    return true;
                }
                outcome.settled
            }
            Err((e, alert)) => {
                metrics::SECURE_ERRORS_TOTAL.inc();
                warn!("Secure flush failed for client {}: {}", self.inner.peer, e);
                let _ = self.send_raw(alert);
                self.close();
                true
            }
        }
    }

    fn send_raw(&self, buf: Bytes) -> Result<(), ProxyError> {
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len();
        self.inner.outbound_backlog.add(len);
        self.inner.outbound.send(buf).map_err(|_| {
            self.inner.outbound_backlog.sub(len);
            ProxyError::Closed
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("protocol", &self.protocol())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut());
        state.release(self.id);
        self.secure.get_mut().take();
        self.closed.cancel();
        metrics::CLIENTS_RELEASED_TOTAL.inc();
        debug!("Client {} ({}) released", self.id, self.peer);
    }
}
