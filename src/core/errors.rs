// src/core/errors.rs

//! Defines the primary error type for the proxy.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every per-connection failure the proxy
/// can hit. None of these are process-fatal; callers react by closing the
/// connection that produced them.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Syntax error")]
    SyntaxError,

    #[error("Unknown protocol key 0x{0:02x}")]
    UnknownProtocol(u8),

    #[error("TLS connection attempted but TLS is not configured")]
    TlsUnavailable,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Secure channel error: {0}")]
    Secure(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Allocation failed: {0}")]
    Alloc(String),

    #[error("Connection is closed")]
    Closed,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for ProxyError {
    fn clone(&self) -> Self {
        match self {
            ProxyError::Io(e) => ProxyError::Io(Arc::clone(e)),
            ProxyError::IncompleteData => ProxyError::IncompleteData,
            ProxyError::SyntaxError => ProxyError::SyntaxError,
            ProxyError::UnknownProtocol(b) => ProxyError::UnknownProtocol(*b),
            ProxyError::TlsUnavailable => ProxyError::TlsUnavailable,
            ProxyError::Protocol(s) => ProxyError::Protocol(s.clone()),
            ProxyError::Http(s) => ProxyError::Http(s.clone()),
            ProxyError::Secure(s) => ProxyError::Secure(s.clone()),
            ProxyError::Upstream(s) => ProxyError::Upstream(s.clone()),
            ProxyError::Alloc(s) => ProxyError::Alloc(s.clone()),
            ProxyError::Closed => ProxyError::Closed,
            ProxyError::Internal(s) => ProxyError::Internal(s.clone()),
        }
    }
}

impl PartialEq for ProxyError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ProxyError::Io(e1), ProxyError::Io(e2)) => e1.to_string() == e2.to_string(),
            (ProxyError::UnknownProtocol(b1), ProxyError::UnknownProtocol(b2)) => b1 == b2,
            (ProxyError::Protocol(s1), ProxyError::Protocol(s2)) => s1 == s2,
            (ProxyError::Http(s1), ProxyError::Http(s2)) => s1 == s2,
            (ProxyError::Secure(s1), ProxyError::Secure(s2)) => s1 == s2,
            (ProxyError::Upstream(s1), ProxyError::Upstream(s2)) => s1 == s2,
            (ProxyError::Alloc(s1), ProxyError::Alloc(s2)) => s1 == s2,
            (ProxyError::Internal(s1), ProxyError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

/// Failures reported by the cross-thread callback primitive.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackError {
    /// No room could be reserved in the call queue.
    #[error("could not allocate a call")]
    Alloc,
    /// The target callback has been stopped.
    #[error("callback has been stopped")]
    Stopped,
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(Arc::new(e))
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(e: rustls::Error) -> Self {
        ProxyError::Secure(e.to_string())
    }
}

impl From<httparse::Error> for ProxyError {
    fn from(e: httparse::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for ProxyError {
    fn from(e: std::collections::TryReserveError) -> Self {
        ProxyError::Alloc(e.to_string())
    }
}

impl From<CallbackError> for ProxyError {
    fn from(e: CallbackError) -> Self {
        match e {
            CallbackError::Alloc => ProxyError::Alloc("callback queue".to_string()),
            CallbackError::Stopped => ProxyError::Internal(e.to_string()),
        }
    }
}
