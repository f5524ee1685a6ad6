// src/core/secure/rustls_engine.rs

//! A `SecureEngine` backed by a rustls `ServerConnection`, driven purely
//! through `read_tls`/`write_tls` on memory buffers.

use super::{EngineFactory, EngineStatus, SecureEngine};
use crate::core::errors::ProxyError;
use bytes::{Bytes, BytesMut};
use rustls::{ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;

const READ_CHUNK: usize = 16 * 1024;

pub struct RustlsEngine {
    conn: ServerConnection,
    plain: BytesMut,
    peer_closed: bool,
}

impl RustlsEngine {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, ProxyError> {
        let mut conn = ServerConnection::new(config)?;
        // Outbound plaintext is never refused; ordering is handled by the
        // deferred list instead.
        conn.set_buffer_limit(None);
        Ok(Self {
            conn,
            plain: BytesMut::new(),
            peer_closed: false,
        })
    }

    /// Moves decrypted application data out of rustls so its received
    /// plaintext buffer never fills up.
    fn drain_plaintext(&mut self) -> Result<(), ProxyError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => self.plain.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl SecureEngine for RustlsEngine {
    fn feed(&mut self, ciphertext: &[u8]) -> Result<(), ProxyError> {
        let mut rd = ciphertext;
        while !rd.is_empty() {
            let n = self.conn.read_tls(&mut rd)?;
            if n == 0 {
                break;
            }
            self.conn.process_new_packets()?;
            self.drain_plaintext()?;
        }
        Ok(())
    }

    fn decrypt(&mut self, out: &mut BytesMut) -> Result<EngineStatus, ProxyError> {
        out.unsplit(self.plain.split());
        if self.conn.is_handshaking() {
            Ok(EngineStatus::WantRead)
        } else {
            Ok(EngineStatus::Done)
        }
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<EngineStatus, ProxyError> {
        if self.conn.is_handshaking() {
            return Ok(EngineStatus::WantRead);
        }
        self.conn.writer().write_all(plaintext)?;
        Ok(EngineStatus::Done)
    }

    fn has_output(&self) -> bool {
        self.conn.wants_write()
    }

    fn take_output(&mut self) -> Result<Bytes, ProxyError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok(Bytes::from(out))
    }

    fn peer_closed(&self) -> bool {
        self.peer_closed
    }
}

/// Builds a fresh rustls engine per connection from a shared server config.
pub struct RustlsFactory {
    config: Arc<ServerConfig>,
}

impl RustlsFactory {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl EngineFactory for RustlsFactory {
    fn create(&self) -> Result<Box<dyn SecureEngine>, ProxyError> {
        Ok(Box::new(RustlsEngine::new(self.config.clone())?))
    }
}
