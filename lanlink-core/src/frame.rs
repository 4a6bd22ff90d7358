//! Ethernet II framing: addresses, EtherType filter value, minimum-size pad.

use std::fmt;
use std::str::FromStr;

/// EtherType carried by every lanlink frame. IEEE local experimental range.
pub const ETHERTYPE: u16 = 0x88B5;

/// Ethernet II header: dst (6) + src (6) + EtherType (2).
pub const HEADER_LEN: usize = 14;

/// Largest Ethernet payload (one MTU).
pub const MAX_PAYLOAD: usize = 1500;

/// Minimum frame length before FCS; shorter frames are zero-padded on encode.
pub const MIN_FRAME_LEN: usize = 60;

/// Six-octet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error parsing a textual MAC address.
#[derive(Debug, thiserror::Error)]
#[error("invalid MAC address")]
pub struct MacParseError;

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for octet in out.iter_mut() {
            let part = parts.next().ok_or(MacParseError)?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| MacParseError)?;
        }
        if parts.next().is_some() {
            return Err(MacParseError);
        }
        Ok(MacAddr(out))
    }
}

/// One Ethernet II frame. On decode the payload still carries any trailing
/// pad; the PDU codec's length field is the authoritative payload length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(dst: MacAddr, src: MacAddr, payload: Vec<u8>) -> Self {
        Frame {
            dst,
            src,
            ethertype: ETHERTYPE,
            payload,
        }
    }

    /// Serialize for transmission, zero-padding to the 60-byte minimum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((HEADER_LEN + self.payload.len()).max(MIN_FRAME_LEN));
        out.extend_from_slice(self.dst.as_bytes());
        out.extend_from_slice(self.src.as_bytes());
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        if out.len() < MIN_FRAME_LEN {
            out.resize(MIN_FRAME_LEN, 0);
        }
        out
    }

    /// Parse received wire bytes. Needs at least the 14-byte header.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Malformed(bytes.len()));
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&bytes[0..6]);
        src.copy_from_slice(&bytes[6..12]);
        let ethertype = u16::from_be_bytes([bytes[12], bytes[13]]);
        Ok(Frame {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// Error decoding wire bytes into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0} bytes")]
    Malformed(usize),
}
