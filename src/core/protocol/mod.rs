// src/core/protocol/mod.rs

//! Wire protocols spoken on the shared listening sockets, and the first-byte
//! classifier that tells them apart.

pub mod pcp;
pub mod resp_frame;

pub use pcp::{PcpAction, PcpPhase, PcpRelay};
pub use resp_frame::{RespFrameCodec, frame_len};

use bitflags::bitflags;

bitflags! {
    /// The protocol bitmask carried by every connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protocol: u8 {
        const PCP    = 1 << 0;
        const HTTP   = 1 << 1;
        const REDIS  = 1 << 2;
        const SECURE = 1 << 3;
    }
}

impl Protocol {
    /// The data-carrying protocols. At most one of these is ever set.
    pub const DATA: Protocol = Protocol::PCP.union(Protocol::HTTP).union(Protocol::REDIS);

    /// Returns the data-carrying bit of this mask, if one has been set.
    pub fn data(self) -> Option<Protocol> {
        let data = self & Self::DATA;
        (!data.is_empty()).then_some(data)
    }

    /// A short lowercase name, used for metrics labels and logs.
    pub fn name(self) -> &'static str {
        match self.data() {
            Some(p) if p == Protocol::PCP => "pcp",
            Some(p) if p == Protocol::HTTP => "http",
            Some(p) if p == Protocol::REDIS => "redis",
            _ if self.contains(Protocol::SECURE) => "secure",
            _ => "unknown",
        }
    }
}

/// The byte a PCP proxy client opens with, the first byte of its
/// identification line.
pub const PCP_MARKER: u8 = b'p';

/// First letters of the HTTP request methods we serve.
pub const HTTP_METHOD_INITIALS: &[u8] = b"GHPDTOC";

/// RESP type sigils for both RESP2 and RESP3 request/response frames.
pub const RESP_SIGILS: &[u8] = b"-+:,$*#%~";

/// TLS record content types: change_cipher_spec, alert, handshake,
/// application_data and heartbeat.
pub const TLS_RECORD_TYPES: std::ops::RangeInclusive<u8> = 0x14..=0x18;

/// Maps the first byte of a fresh connection onto a protocol.
///
/// Returns `None` for any byte outside the marker sets; the caller closes
/// such connections.
pub fn classify(first: u8) -> Option<Protocol> {
    if first == PCP_MARKER {
        Some(Protocol::PCP)
    } else if HTTP_METHOD_INITIALS.contains(&first) {
        Some(Protocol::HTTP)
    } else if RESP_SIGILS.contains(&first) {
        Some(Protocol::REDIS)
    } else if TLS_RECORD_TYPES.contains(&first) {
        Some(Protocol::SECURE)
    } else {
        None
    }
}
