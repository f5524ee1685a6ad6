// src/core/mod.rs

//! The proxy core: errors, metrics, the callback primitive, wire protocols,
//! the secure-channel layer, upstream relays and the `Proxy` itself.

pub mod backlog;
pub mod callback;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod secure;

pub use backlog::Backlog;
pub use callback::{Callback, CallbackLoop, CallbackMode};
pub use errors::{CallbackError, ProxyError};
pub use protocol::Protocol;
pub use proxy::{Proxy, WorkerReply};
