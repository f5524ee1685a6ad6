// src/core/protocol/pcp.rs

//! The PCP passthrough handshake.
//!
//! A PCP client first identifies itself with a fixed line, is answered with
//! the server's line, then names the collector it wants with
//! `"<hostname> <port>\n"`. From then on the connection is a transparent pipe
//! to that collector. This module is the pure state machine; dialing and
//! byte pumping live in `core::relay`.

use crate::core::errors::ProxyError;
use bytes::{Bytes, BytesMut};

pub const CLIENT_HEADER: &[u8] = b"pmproxy-client 1\n";
pub const SERVER_HEADER: &[u8] = b"pmproxy-server 1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcpPhase {
    #[default]
    Unknown,
    Header,
    Hostspec,
    Connect,
    Setup,
}

/// What the connection layer must do in response to inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcpAction {
    /// Write these bytes back to the client.
    Reply(Bytes),
    /// Open the upstream connection.
    Dial { host: String, port: u16 },
    /// Send these bytes to the upstream, queued in order if it is still dialing.
    Forward(Bytes),
}

#[derive(Debug)]
pub struct PcpRelay {
    phase: PcpPhase,
    matched: usize,
    hostspec: BytesMut,
    max_hostspec: usize,
}

impl PcpRelay {
    pub fn new(max_hostspec: usize) -> Self {
        Self {
            phase: PcpPhase::Unknown,
            matched: 0,
            hostspec: BytesMut::new(),
            max_hostspec,
        }
    }

    pub fn phase(&self) -> PcpPhase {
        self.phase
    }

    /// Feeds inbound client bytes through the handshake.
    pub fn on_data(&mut self, data: &[u8]) -> Result<Vec<PcpAction>, ProxyError> {
        let mut actions = Vec::new();
        let mut rest = data;

        if self.phase == PcpPhase::Unknown {
            self.phase = PcpPhase::Header;
        }

        if self.phase == PcpPhase::Header {
            let want = &CLIENT_HEADER[self.matched..];
            let n = want.len().min(rest.len());
            if rest[..n] != want[..n] {
                return Err(ProxyError::Protocol(
                    "bad PCP client identification".to_string(),
                ));
            }
            self.matched += n;
            rest = &rest[n..];
            if self.matched < CLIENT_HEADER.len() {
                return Ok(actions);
            }
            self.phase = PcpPhase::Hostspec;
            actions.push(PcpAction::Reply(Bytes::from_static(SERVER_HEADER)));
        }

        if self.phase == PcpPhase::Hostspec {
            match rest.iter().position(|&b| b == b'\n') {
                None => {
                    if self.hostspec.len() + rest.len() > self.max_hostspec {
                        return Err(ProxyError::Protocol("PCP hostspec too long".to_string()));
                    }
                    self.hostspec.extend_from_slice(rest);
                    return Ok(actions);
                }
                Some(pos) => {
                    if self.hostspec.len() + pos > self.max_hostspec {
                        return Err(ProxyError::Protocol("PCP hostspec too long".to_string()));
                    }
                    self.hostspec.extend_from_slice(&rest[..pos]);
                    rest = &rest[pos + 1..];
                    let (host, port) = parse_hostspec(&self.hostspec)?;
                    self.hostspec.clear();
                    self.phase = PcpPhase::Connect;
                    actions.push(PcpAction::Dial { host, port });
                }
            }
        }

        // Connect and Setup both forward; the relay queues until dialed.
        if !rest.is_empty() {
            actions.push(PcpAction::Forward(Bytes::copy_from_slice(rest)));
        }
        Ok(actions)
    }

    /// Marks the upstream as connected.
    pub fn connected(&mut self) {
        if self.phase == PcpPhase::Connect {
            self.phase = PcpPhase::Setup;
        }
    }
}

/// Parses `"<hostname> <port>"` (without the trailing newline).
pub fn parse_hostspec(line: &[u8]) -> Result<(String, u16), ProxyError> {
    let malformed = || ProxyError::Protocol("malformed PCP hostspec".to_string());

    let line = std::str::from_utf8(line).map_err(|_| malformed())?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut parts = line.split(' ');
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed());
    };
    if host.is_empty() {
        return Err(malformed());
    }
    let port = port.parse::<u16>().map_err(|_| malformed())?;
    if port == 0 {
        return Err(malformed());
    }
    Ok((host.to_string(), port))
}
