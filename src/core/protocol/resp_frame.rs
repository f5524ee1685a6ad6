// src/core/protocol/resp_frame.rs

//! RESP frame boundaries as a `tokio_util` decoder.
//!
//! The proxy never interprets Redis commands; it only needs to find where
//! each frame ends so that complete requests are forwarded upstream as units.
//! Both RESP2 and the RESP3 scalar/aggregate types are understood.
//!
//! The scanner is resumable. Progress through a partially received frame is
//! kept between reads (an offset plus a stack of element counts still owed by
//! the open aggregates), so each read only scans the bytes it added. An
//! element cut short by the end of the buffer is rescanned from its own
//! start, which is bounded by `MAX_LINE_BYTES` for line elements and by the
//! length header for bulk elements.

use crate::core::errors::ProxyError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Limits on untrusted input.
const MAX_FRAME_ELEMENTS: u64 = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_NESTING_DEPTH: usize = 256;
const MAX_LINE_BYTES: usize = 64 * 1024;

const SIGILS: &[u8] = b"+-:,#_($!=*~>%";

/// One element scanned at the head of the unscanned input.
enum Element {
    /// A scalar (or null aggregate) of `len` bytes.
    Scalar { len: usize },
    /// An aggregate header of `len` bytes owing `children` nested elements.
    Aggregate { len: usize, children: u64 },
}

/// Result of a single element scan.
enum Scan {
    Complete(Element),
    /// More input is needed; `examined` bytes were looked at.
    Incomplete { examined: usize },
}

/// Splits a RESP byte stream into raw frames.
#[derive(Debug, Default)]
pub struct RespFrameCodec {
    /// Bytes of the current frame already scanned.
    scanned: usize,
    /// Elements still owed by each open aggregate, innermost last.
    open: Vec<u64>,
    /// Total bytes examined over the codec's lifetime.
    examined: u64,
}

impl RespFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the frame in progress that have already been scanned.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Total bytes this codec has looked at. Stays linear in the input size
    /// however the input is split into reads.
    pub fn bytes_examined(&self) -> u64 {
        self.examined
    }

    /// Advances the scan over `src`, which must start with the frame in
    /// progress. Returns the frame's length once it is complete, resetting the
    /// scanner for the next frame.
    pub fn scan(&mut self, src: &[u8]) -> Result<Option<usize>, ProxyError> {
        loop {
            let rest = src.get(self.scanned..).unwrap_or_default();
            let element = match scan_element(rest)? {
                Scan::Incomplete { examined } => {
                    self.examined += examined as u64;
                    return Ok(None);
                }
                Scan::Complete(element) => element,
            };

            // Whatever was just scanned fills one slot of its parent.
            if let Some(owed) = self.open.last_mut() {
                *owed -= 1;
            }
            match element {
                Element::Scalar { len } => {
                    self.scanned += len;
                    self.examined += len as u64;
                }
                Element::Aggregate { len, children } => {
                    self.scanned += len;
                    self.examined += len as u64;
                    if children > 0 {
                        if self.open.len() >= MAX_NESTING_DEPTH {
                            return Err(ProxyError::Protocol(
                                "RESP nesting depth limit exceeded".to_string(),
                            ));
                        }
                        self.open.push(children);
                    }
                }
            }
            while self.open.last() == Some(&0) {
                self.open.pop();
            }

            if self.open.is_empty() {
                let len = self.scanned;
                self.scanned = 0;
                return Ok(Some(len));
            }
        }
    }
}

/// The byte length of the first complete frame in `src`, or `None` if more
/// input is needed.
pub fn frame_len(src: &[u8]) -> Result<Option<usize>, ProxyError> {
    RespFrameCodec::new().scan(src)
}

impl Decoder for RespFrameCodec {
    type Item = Bytes;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match self.scan(src)? {
            Some(len) => Ok(Some(src.split_to(len).freeze())),
            None => Ok(None),
        }
    }
}

fn scan_element(src: &[u8]) -> Result<Scan, ProxyError> {
    let Some(&sigil) = src.first() else {
        return Ok(Scan::Incomplete { examined: 0 });
    };
    if !SIGILS.contains(&sigil) {
        return Err(ProxyError::SyntaxError);
    }
    let Some(line_end) = find_line_end(&src[1..])? else {
        return Ok(Scan::Incomplete {
            examined: src.len(),
        });
    };
    let line = &src[1..1 + line_end];
    let header_len = 1 + line_end + CRLF_LEN;

    let element = match sigil {
        b'+' | b'-' | b'(' => Element::Scalar { len: header_len },
        b':' => {
            parse_int(line)?;
            Element::Scalar { len: header_len }
        }
        b',' => {
            parse_double(line)?;
            Element::Scalar { len: header_len }
        }
        b'#' => match line {
            b"t" | b"f" => Element::Scalar { len: header_len },
            _ => return Err(ProxyError::SyntaxError),
        },
        b'_' if line.is_empty() => Element::Scalar { len: header_len },
        b'$' | b'!' | b'=' => {
            let len = parse_int(line)?;
            if len == -1 && sigil == b'$' {
                Element::Scalar { len: header_len }
            } else {
                let len = usize::try_from(len).map_err(|_| ProxyError::SyntaxError)?;
                if len > MAX_BULK_STRING_SIZE {
                    return Err(ProxyError::SyntaxError);
                }
                let total = header_len + len + CRLF_LEN;
                if src.len() < total {
                    return Ok(Scan::Incomplete {
                        examined: header_len,
                    });
                }
                if &src[total - CRLF_LEN..total] != CRLF {
                    return Err(ProxyError::SyntaxError);
                }
                Element::Scalar { len: total }
            }
        }
        b'*' | b'~' | b'>' | b'%' => {
            let count = parse_int(line)?;
            if count == -1 && sigil == b'*' {
                Element::Scalar { len: header_len }
            } else {
                let count = u64::try_from(count).map_err(|_| ProxyError::SyntaxError)?;
                if count > MAX_FRAME_ELEMENTS {
                    return Err(ProxyError::SyntaxError);
                }
                let children = if sigil == b'%' { count * 2 } else { count };
                Element::Aggregate {
                    len: header_len,
                    children,
                }
            }
        }
        _ => return Err(ProxyError::SyntaxError),
    };
    Ok(Scan::Complete(element))
}

/// Finds the CRLF ending a header line. A bare LF, or a line longer than
/// `MAX_LINE_BYTES`, is a syntax error.
fn find_line_end(src: &[u8]) -> Result<Option<usize>, ProxyError> {
    let window = &src[..src.len().min(MAX_LINE_BYTES + CRLF_LEN)];
    match window.iter().position(|&b| b == b'\n') {
        Some(pos) if pos > 0 && window[pos - 1] == b'\r' => Ok(Some(pos - 1)),
        Some(_) => Err(ProxyError::SyntaxError),
        None if window.len() > MAX_LINE_BYTES => Err(ProxyError::SyntaxError),
        None => Ok(None),
    }
}

fn parse_int(line: &[u8]) -> Result<i64, ProxyError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ProxyError::SyntaxError)
}

fn parse_double(line: &[u8]) -> Result<f64, ProxyError> {
    match line {
        b"inf" => Ok(f64::INFINITY),
        b"-inf" => Ok(f64::NEG_INFINITY),
        _ => std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or(ProxyError::SyntaxError),
    }
}
