// src/core/secure/mod.rs

//! The secure-channel buffering layer.
//!
//! A TLS engine here is never handed a socket. Ciphertext from the network
//! is pushed into it, and ciphertext for the network is pulled out of it,
//! through memory buffers. The connection layer moves those bytes to and from
//! the real socket.
//!
//! Encryption can fail with "want more input" while the engine still needs
//! bytes from the peer (handshake or renegotiation in progress). Writes hit by
//! that are deferred in order and retried only after a later successful read;
//! the owning connection sits in the proxy's pending set until its deferred
//! list is empty.

pub mod pending;
pub mod rustls_engine;

pub use pending::PendingWrites;
pub use rustls_engine::{RustlsEngine, RustlsFactory};

use crate::core::errors::ProxyError;
use crate::core::metrics;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Outcome of a single engine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The step completed.
    Done,
    /// The engine needs more ciphertext from the peer before it can proceed.
    WantRead,
}

/// A memory-buffer driven TLS engine.
pub trait SecureEngine: Send {
    /// Pushes ciphertext received from the peer into the engine.
    fn feed(&mut self, ciphertext: &[u8]) -> Result<(), ProxyError>;

    /// Appends all plaintext currently available to `out`.
    fn decrypt(&mut self, out: &mut BytesMut) -> Result<EngineStatus, ProxyError>;

    /// Encrypts one plaintext buffer. On `WantRead` nothing was consumed.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<EngineStatus, ProxyError>;

    /// Whether ciphertext is waiting to be sent to the peer.
    fn has_output(&self) -> bool;

    /// Takes all ciphertext waiting to be sent to the peer.
    fn take_output(&mut self) -> Result<Bytes, ProxyError>;

    /// Whether the peer has cleanly ended the secure session.
    fn peer_closed(&self) -> bool {
        false
    }
}

/// Creates one engine per accepted secure connection.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn SecureEngine>, ProxyError>;
}

#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub plaintext: Bytes,
    pub ciphertext: Bytes,
    pub want_read: bool,
    pub peer_closed: bool,
}

#[derive(Debug, Default)]
pub struct WriteOutcome {
    /// Ciphertext to send now, covering every buffer encrypted before the
    /// first deferral.
    pub ciphertext: Bytes,
    /// Whether any buffers are now waiting for a read.
    pub deferred: bool,
}

#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub ciphertext: Bytes,
    /// No deferred buffers and no engine output remain.
    pub settled: bool,
}

/// The per-connection secure sub-record.
pub struct SecureChannel {
    engine: Box<dyn SecureEngine>,
    deferred: VecDeque<Bytes>,
    read_since_deferred: bool,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("deferred", &self.deferred.len())
            .field("read_since_deferred", &self.read_since_deferred)
            .finish()
    }
}

impl SecureChannel {
    pub fn new(engine: Box<dyn SecureEngine>) -> Self {
        Self {
            engine,
            deferred: VecDeque::new(),
            read_since_deferred: false,
        }
    }

    /// Handles ciphertext read from the socket.
    pub fn on_read(&mut self, data: &[u8]) -> Result<ReadOutcome, ProxyError> {
        self.engine.feed(data)?;
        let mut plain = BytesMut::new();
        let status = self.engine.decrypt(&mut plain)?;
        self.read_since_deferred = true;

        Ok(ReadOutcome {
            plaintext: plain.freeze(),
            ciphertext: self.drain_output()?,
            want_read: status == EngineStatus::WantRead,
            peer_closed: self.engine.peer_closed(),
        })
    }

    /// Encrypts `buffers` in order. Once one buffer has to wait, it and every
    /// buffer after it are deferred, including buffers from later calls.
    pub fn write(&mut self, buffers: Vec<Bytes>) -> Result<WriteOutcome, ProxyError> {
        for buf in buffers {
            if !self.deferred.is_empty() {
                self.defer(buf)?;
                continue;
            }
            if self.engine.encrypt(&buf)? == EngineStatus::WantRead {
                self.read_since_deferred = false;
                self.defer(buf)?;
            }
        }

        Ok(WriteOutcome {
            ciphertext: self.drain_output()?,
            deferred: !self.deferred.is_empty(),
        })
    }

    /// Retries deferred buffers if a read has happened since they were
    /// deferred, and drains engine output.
    pub fn flush(&mut self) -> Result<FlushOutcome, ProxyError> {
        if self.read_since_deferred {
            while let Some(buf) = self.deferred.front() {
                if self.engine.encrypt(buf)? == EngineStatus::WantRead {
                    self.read_since_deferred = false;
                    break;
                }
                self.deferred.pop_front();
            }
        }

        let ciphertext = self.drain_output()?;
        Ok(FlushOutcome {
            ciphertext,
            settled: self.is_settled(),
        })
    }

    pub fn is_settled(&self) -> bool {
        self.deferred.is_empty() && !self.engine.has_output()
    }

    /// Takes whatever the engine queued before it failed, typically a fatal
    /// alert for the peer. A failure while draining yields nothing.
    pub fn take_alert(&mut self) -> Bytes {
        self.drain_output().unwrap_or_default()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn defer(&mut self, buf: Bytes) -> Result<(), ProxyError> {
        self.deferred.try_reserve(1)?;
        self.deferred.push_back(buf);
        metrics::SECURE_DEFERRED_WRITES_TOTAL.inc();
        Ok(())
    }

    fn drain_output(&mut self) -> Result<Bytes, ProxyError> {
        if self.engine.has_output() {
            self.engine.take_output()
        } else {
            Ok(Bytes::new())
        }
    }
}
