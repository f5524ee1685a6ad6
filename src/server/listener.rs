// src/server/listener.rs

//! Binding the configured listening sockets.

use super::stream::AnyStream;
use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use socket2::{Domain, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};

pub enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl AnyListener {
    /// Accepts one stream, applying TCP options. Returns the stream and a
    /// printable peer name.
    pub async fn accept(&self, keepalive: Duration) -> std::io::Result<(AnyStream, String)> {
        match self {
            AnyListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                if !keepalive.is_zero() {
                    let params = TcpKeepalive::new().with_time(keepalive);
                    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&params) {
                        warn!("Failed to set keepalive for {}: {}", addr, e);
                    }
                }
                Ok((AnyStream::Tcp(stream), addr.to_string()))
            }
            AnyListener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((AnyStream::Unix(stream), format!("local:{}", path.display())))
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            AnyListener::Tcp(listener) => listener.local_addr().ok(),
            AnyListener::Unix(..) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AnyListener::Tcp(listener) => listener
                .local_addr()
                .map_or_else(|_| "tcp:?".to_string(), |a| a.to_string()),
            AnyListener::Unix(_, path) => format!("local:{}", path.display()),
        }
    }
}

/// Binds one TCP listener. IPv6 sockets are v6-only so the same port can be
/// shared with the IPv4 wildcard.
pub fn bind_tcp(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    TcpListener::from_std(socket.into())
}

/// Binds the unix-domain listener, replacing a stale socket file.
pub fn bind_local(path: &Path, backlog: u32) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    let std_listener: std::os::unix::net::UnixListener = socket.into();
    UnixListener::from_std(std_listener)
}

/// Binds every configured address. Individual failures are logged; failing
/// to bind anything is fatal.
pub fn bind_all(config: &Config) -> Result<Vec<AnyListener>> {
    let mut listeners = Vec::new();

    for addr in &config.addresses {
        match bind_tcp(*addr, config.listen.backlog) {
            Ok(listener) => {
                info!("pmproxy listening on {}", addr);
                listeners.push(AnyListener::Tcp(listener));
            }
            Err(e) => warn!("Failed to bind {}: {}", addr, e),
        }
    }

    if let Some(path) = &config.listen.local_path {
        let path = PathBuf::from(path);
        match bind_local(&path, config.listen.backlog)
            .with_context(|| format!("binding local socket {}", path.display()))
        {
            Ok(listener) => {
                info!("pmproxy listening on local:{}", path.display());
                listeners.push(AnyListener::Unix(listener, path));
            }
            Err(e) => warn!("{:#}", e),
        }
    }

    if listeners.is_empty() {
        return Err(anyhow!("can't open any request ports, exiting"));
    }
    Ok(listeners)
}
