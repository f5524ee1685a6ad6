// src/connection/state.rs

//! Per-protocol connection state, chosen once at classification time.

use super::client::Client;
use crate::core::errors::ProxyError;
use crate::core::protocol::{PcpAction, PcpRelay, Protocol, RespFrameCodec};
use crate::core::proxy::Proxy;
use crate::core::relay::{self, OnConnected, UpstreamLink};
use crate::http::HttpSession;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::debug;

#[derive(Default)]
pub enum ProtocolState {
    #[default]
    Unknown,
    Pcp(PcpSession),
    Http(HttpSession),
    Redis(RedisSession),
}

impl ProtocolState {
    /// Builds the empty state for a freshly classified data protocol.
    pub fn for_protocol(protocol: Protocol, proxy: &Proxy) -> Self {
        let config = proxy.config();
        if protocol == Protocol::PCP {
            ProtocolState::Pcp(PcpSession::new(config.pcp.max_hostspec_bytes))
        } else if protocol == Protocol::HTTP {
            ProtocolState::Http(HttpSession::new(
                config.http.max_header_bytes,
                config.http.chunk_size,
            ))
        } else if protocol == Protocol::REDIS {
            ProtocolState::Redis(RedisSession::default())
        } else {
            ProtocolState::Unknown
        }
    }

    /// Routes plaintext input to the active protocol.
    pub fn on_data(&mut self, client: &Client, data: Bytes) -> Result<(), ProxyError> {
        match self {
            ProtocolState::Unknown => Err(ProxyError::Internal(
                "data delivered to an unclassified connection".to_string(),
            )),
            ProtocolState::Pcp(session) => session.on_data(client, data),
            ProtocolState::Http(session) => session.on_data(client, data),
            ProtocolState::Redis(session) => session.on_data(client, data),
        }
    }

    /// Protocol teardown, run when the last reference to a connection is
    /// released. Dropping an upstream link ends its relay task.
    pub fn release(self, client_id: u64) {
        match self {
            ProtocolState::Http(session) => session.release(client_id),
            ProtocolState::Pcp(session) => {
                if session.upstream.is_some() {
                    debug!("Client {}: releasing PCP upstream", client_id);
                }
            }
            ProtocolState::Redis(_) | ProtocolState::Unknown => {}
        }
    }

    pub fn pcp(&mut self) -> Option<&mut PcpSession> {
        match self {
            ProtocolState::Pcp(session) => Some(session),
            _ => None,
        }
    }
}

pub struct PcpSession {
    relay: PcpRelay,
    upstream: Option<UpstreamLink>,
}

impl PcpSession {
    pub fn new(max_hostspec: usize) -> Self {
        Self {
            relay: PcpRelay::new(max_hostspec),
            upstream: None,
        }
    }

    pub fn relay(&self) -> &PcpRelay {
        &self.relay
    }

    fn on_data(&mut self, client: &Client, data: Bytes) -> Result<(), ProxyError> {
        for action in self.relay.on_data(&data)? {
            match action {
                PcpAction::Reply(reply) => client.write([reply])?,
                PcpAction::Dial { host, port } => {
                    debug!("Client {}: PCP relay to {}:{}", client.peer(), host, port);
                    let timeout = client.proxy().config().pcp.connect_timeout;
                    self.upstream = Some(relay::dial(
                        client,
                        host,
                        port,
                        timeout,
                        Some(Box::new(mark_connected) as OnConnected),
                    ));
                }
                PcpAction::Forward(bytes) => match &self.upstream {
                    Some(link) => link.send(bytes)?,
                    None => {
                        return Err(ProxyError::Internal(
                            "PCP data before upstream dial".to_string(),
                        ));
                    }
                },
            }
        }
        Ok(())
    }
}

fn mark_connected(client: &Client) {
    if let Some(session) = client.lock_state().pcp() {
        session.relay.connected();
    }
}

/// Redis passthrough: complete RESP frames are forwarded to the configured
/// backend, which is dialed on the first frame.
#[derive(Default)]
pub struct RedisSession {
    buffer: BytesMut,
    codec: RespFrameCodec,
    upstream: Option<UpstreamLink>,
}

impl RedisSession {
    fn on_data(&mut self, client: &Client, data: Bytes) -> Result<(), ProxyError> {
        self.buffer.extend_from_slice(&data);
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            self.link(client)?.send(frame)?;
        }
        Ok(())
    }

    fn link(&mut self, client: &Client) -> Result<&UpstreamLink, ProxyError> {
        if self.upstream.is_none() {
            let proxy = client.proxy();
            let (host, port) = proxy
                .config()
                .redis_upstream()
                .map_err(|e| ProxyError::Upstream(e.to_string()))?;
            let timeout = proxy.config().pcp.connect_timeout;
            self.upstream = Some(relay::dial(client, host, port, timeout, None));
        }
        self.upstream
            .as_ref()
            .ok_or_else(|| ProxyError::Internal("redis upstream missing".to_string()))
    }
}
