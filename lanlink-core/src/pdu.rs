//! Application PDU codec: 13-byte big-endian header plus typed bodies.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::frame;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed PDU header: version (1) + type (1) + flags (1) + msg_id (4) +
/// frag_index (2) + frag_total (2) + payload_len (2).
pub const HEADER_LEN: usize = 13;

/// Largest PDU payload that still fits one Ethernet frame.
pub const MAX_PAYLOAD: usize = frame::MAX_PAYLOAD - HEADER_LEN;

/// Longest display name carried in HELLO / HELLO-ACK, in bytes.
pub const MAX_DISPLAY_NAME: usize = 64;

// Header flag bits; remaining bits are reserved and sent as zero.
pub const FLAG_MORE_FRAGMENTS: u8 = 0x01;
pub const FLAG_ACK_REQUIRED: u8 = 0x02;
pub const FLAG_IS_ACK: u8 = 0x04;

/// PDU type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    Hello = 1,
    HelloAck = 2,
    Text = 3,
    FileOffer = 4,
    FileData = 5,
    FileAck = 6,
    FileComplete = 7,
    Goodbye = 8,
}

impl PduType {
    pub fn from_u8(value: u8) -> Option<PduType> {
        match value {
            1 => Some(PduType::Hello),
            2 => Some(PduType::HelloAck),
            3 => Some(PduType::Text),
            4 => Some(PduType::FileOffer),
            5 => Some(PduType::FileData),
            6 => Some(PduType::FileAck),
            7 => Some(PduType::FileComplete),
            8 => Some(PduType::Goodbye),
            _ => None,
        }
    }
}

/// One protocol data unit: header fields plus the type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub ptype: PduType,
    pub flags: u8,
    pub msg_id: u32,
    pub frag_index: u16,
    pub frag_total: u16,
    pub payload: Vec<u8>,
}

impl Pdu {
    /// A non-fragmented PDU: one fragment, index zero, no flags.
    pub fn single(ptype: PduType, msg_id: u32, payload: Vec<u8>) -> Pdu {
        Pdu {
            ptype,
            flags: 0,
            msg_id,
            frag_index: 0,
            frag_total: 1,
            payload,
        }
    }

    pub fn more_fragments(&self) -> bool {
        self.flags & FLAG_MORE_FRAGMENTS != 0
    }

    pub fn ack_required(&self) -> bool {
        self.flags & FLAG_ACK_REQUIRED != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_IS_ACK != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(PROTOCOL_VERSION);
        out.push(self.ptype as u8);
        out.push(self.flags);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.frag_index.to_be_bytes());
        out.extend_from_slice(&self.frag_total.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a PDU from an Ethernet payload. Bytes beyond `payload_len` are
    /// frame pad and are ignored.
    pub fn parse(buf: &[u8]) -> Result<Pdu, PduError> {
        if buf.len() < HEADER_LEN {
            return Err(PduError::Truncated);
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(PduError::BadVersion(buf[0]));
        }
        let ptype = PduType::from_u8(buf[1]).ok_or(PduError::BadType(buf[1]))?;
        let flags = buf[2];
        let msg_id = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        let frag_index = u16::from_be_bytes([buf[7], buf[8]]);
        let frag_total = u16::from_be_bytes([buf[9], buf[10]]);
        let payload_len = u16::from_be_bytes([buf[11], buf[12]]) as usize;
        if buf.len() < HEADER_LEN + payload_len {
            return Err(PduError::Truncated);
        }
        Ok(Pdu {
            ptype,
            flags,
            msg_id,
            frag_index,
            frag_total,
            payload: buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        })
    }
}

/// Error parsing a PDU header or body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PduError {
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown PDU type {0}")]
    BadType(u8),
    #[error("truncated PDU")]
    Truncated,
    #[error("malformed PDU body")]
    BadBody,
}

/// FILE-OFFER body: file size (8) + fragment count (4) + filename length (2)
/// + filename + SHA-256 digest (32).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOfferBody {
    pub file_size: u64,
    pub frag_count: u32,
    pub filename: String,
    pub digest: [u8; 32],
}

impl FileOfferBody {
    pub fn encode(&self) -> Vec<u8> {
        let name = self.filename.as_bytes();
        let mut out = Vec::with_capacity(14 + name.len() + 32);
        out.extend_from_slice(&self.file_size.to_be_bytes());
        out.extend_from_slice(&self.frag_count.to_be_bytes());
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<FileOfferBody, PduError> {
        if buf.len() < 14 {
            return Err(PduError::Truncated);
        }
        let file_size = u64::from_be_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        let frag_count = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let name_len = u16::from_be_bytes([buf[12], buf[13]]) as usize;
        if buf.len() < 14 + name_len + 32 {
            return Err(PduError::Truncated);
        }
        let filename = std::str::from_utf8(&buf[14..14 + name_len])
            .map_err(|_| PduError::BadBody)?
            .to_string();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[14 + name_len..14 + name_len + 32]);
        Ok(FileOfferBody {
            file_size,
            frag_count,
            filename,
            digest,
        })
    }
}

/// FILE-ACK body: acknowledged msg_id (4) + acknowledged frag_index (2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAckBody {
    pub msg_id: u32,
    pub frag_index: u16,
}

impl FileAckBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.frag_index.to_be_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<FileAckBody, PduError> {
        if buf.len() < 6 {
            return Err(PduError::Truncated);
        }
        Ok(FileAckBody {
            msg_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            frag_index: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}

/// FILE-COMPLETE body: msg_id (4) + digest verification flag (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCompleteBody {
    pub msg_id: u32,
    pub digest_ok: bool,
}

impl FileCompleteBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.push(u8::from(self.digest_ok));
        out
    }

    pub fn parse(buf: &[u8]) -> Result<FileCompleteBody, PduError> {
        if buf.len() < 5 {
            return Err(PduError::Truncated);
        }
        Ok(FileCompleteBody {
            msg_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            digest_ok: buf[4] == 1,
        })
    }
}

/// Message-id allocator: randomly seeded, monotonically increasing, wraps at
/// 2^32 (collisions after wrap are evicted by the reassembly timeout long
/// before they can matter).
#[derive(Debug)]
pub struct MsgIdGen(AtomicU32);

impl MsgIdGen {
    pub fn new() -> MsgIdGen {
        MsgIdGen(AtomicU32::new(rand::random()))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MsgIdGen {
    fn default() -> Self {
        MsgIdGen::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let pdu = Pdu {
            ptype: PduType::Text,
            flags: FLAG_MORE_FRAGMENTS,
            msg_id: 0xDEADBEEF,
            frag_index: 3,
            frag_total: 7,
            payload: b"hola".to_vec(),
        };
        let wire = pdu.encode();
        assert_eq!(wire.len(), HEADER_LEN + 4);
        assert_eq!(Pdu::parse(&wire).unwrap(), pdu);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let pdu = Pdu::single(PduType::Goodbye, 9, Vec::new());
        assert_eq!(Pdu::parse(&pdu.encode()).unwrap(), pdu);
    }

    #[test]
    fn trailing_pad_ignored() {
        let pdu = Pdu::single(PduType::Hello, 1, b"nodo".to_vec());
        let mut wire = pdu.encode();
        wire.resize(wire.len() + 43, 0); // Ethernet pad
        assert_eq!(Pdu::parse(&wire).unwrap(), pdu);
    }

    #[test]
    fn bad_version_rejected() {
        let mut wire = Pdu::single(PduType::Hello, 1, Vec::new()).encode();
        wire[0] = 2;
        assert_eq!(Pdu::parse(&wire), Err(PduError::BadVersion(2)));
    }

    #[test]
    fn bad_type_rejected() {
        let mut wire = Pdu::single(PduType::Hello, 1, Vec::new()).encode();
        wire[1] = 9;
        assert_eq!(Pdu::parse(&wire), Err(PduError::BadType(9)));
        wire[1] = 0;
        assert_eq!(Pdu::parse(&wire), Err(PduError::BadType(0)));
    }

    #[test]
    fn truncated_rejected() {
        let wire = Pdu::single(PduType::Text, 1, vec![1, 2, 3]).encode();
        assert_eq!(Pdu::parse(&wire[..HEADER_LEN + 2]), Err(PduError::Truncated));
        assert_eq!(Pdu::parse(&wire[..5]), Err(PduError::Truncated));
    }

    #[test]
    fn offer_body_roundtrip() {
        let body = FileOfferBody {
            file_size: 1 << 33,
            frag_count: 5771,
            filename: "informe.pdf".into(),
            digest: [7u8; 32],
        };
        assert_eq!(FileOfferBody::parse(&body.encode()).unwrap(), body);
    }

    #[test]
    fn offer_body_truncated() {
        let body = FileOfferBody {
            file_size: 10,
            frag_count: 1,
            filename: "a".into(),
            digest: [0u8; 32],
        };
        let wire = body.encode();
        assert_eq!(
            FileOfferBody::parse(&wire[..wire.len() - 1]),
            Err(PduError::Truncated)
        );
    }

    #[test]
    fn offer_body_rejects_non_utf8_name() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&10u64.to_be_bytes());
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(&[0xFF, 0xFE]);
        wire.extend_from_slice(&[0u8; 32]);
        assert_eq!(FileOfferBody::parse(&wire), Err(PduError::BadBody));
    }

    #[test]
    fn ack_and_complete_bodies_roundtrip() {
        let ack = FileAckBody {
            msg_id: 42,
            frag_index: 0xFFFF,
        };
        assert_eq!(FileAckBody::parse(&ack.encode()).unwrap(), ack);

        let done = FileCompleteBody {
            msg_id: 42,
            digest_ok: true,
        };
        assert_eq!(FileCompleteBody::parse(&done.encode()).unwrap(), done);
        let failed = FileCompleteBody {
            msg_id: 43,
            digest_ok: false,
        };
        assert_eq!(FileCompleteBody::parse(&failed.encode()).unwrap(), failed);
    }

    #[test]
    fn msg_ids_increase() {
        let gen = MsgIdGen::new();
        let a = gen.next();
        let b = gen.next();
        assert_eq!(b, a.wrapping_add(1));
    }
}
