// eDonkey wire protocol: parsing, serialization etc.
//
// Every frame on both the server and the peer wire is
// `proto_id(1) | length(4, LE) | opcode(1) | payload(length - 1)`.
// All multi-byte integers are little-endian.

mod reader;
pub mod peer;
pub mod server;
pub mod tags;

use byteorder::{ByteOrder, LE};

pub use crate::reader::Reader;

/// Standard eDonkey protocol id.
pub const PROTO_EDONKEY: u8 = 0xE3;
/// eMule extended protocol id. Recognised, only the 64-bit part opcodes are
/// spoken.
pub const PROTO_EMULE: u8 = 0xC5;
/// Compressed frames. Recognised and rejected.
pub const PROTO_PACKED: u8 = 0xD4;

pub const FRAME_HEADER_LEN: usize = 6;

/// Max accepted frame payload. The reference server connection caps bodies
/// at 250,000 bytes; peer frames never legitimately exceed it either (the
/// largest is a 180 KiB part message).
pub const MAX_FRAME_SIZE: u32 = 250_000;

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data: expected at least {0} more bytes")]
    NotEnoughData(usize),
    #[error("unsupported protocol type {0:#04x}")]
    UnsupportedProtocolType(u8),
    #[error("invalid packet size {0}")]
    InvalidPacketSize(u32),
    #[error("invalid opcode {opcode:#04x} for protocol {protocol:#04x}")]
    InvalidOpcode { protocol: u8, opcode: u8 },
    #[error("invalid tag type {0:#04x}")]
    InvalidTagType(u8),
    #[error("blob tag too long: {0} bytes")]
    BlobTagTooLong(u32),
    #[error("invalid part ranges in request")]
    InvalidPartRanges,
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("message too large for a single frame: {0} bytes")]
    FrameTooLarge(usize),
    #[error("string too long for its length prefix: {0} bytes")]
    StringTooLong(usize),
}

/// The fixed preamble of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub protocol: u8,
    /// Opcode byte plus payload, i.e. `1 + payload.len()`.
    pub length: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Result<(FrameHeader, u8), MessageDeserializeError> {
        let protocol = buf[0];
        match protocol {
            PROTO_EDONKEY | PROTO_EMULE | PROTO_PACKED => {}
            other => return Err(MessageDeserializeError::UnsupportedProtocolType(other)),
        }
        let length = LE::read_u32(&buf[1..5]);
        if length == 0 || length > MAX_FRAME_SIZE {
            return Err(MessageDeserializeError::InvalidPacketSize(length));
        }
        Ok((FrameHeader { protocol, length }, buf[5]))
    }

    /// Remaining payload after the opcode byte.
    pub fn payload_len(&self) -> usize {
        self.length as usize - 1
    }
}

pub(crate) fn write_frame(out: &mut Vec<u8>, protocol: u8, opcode: u8, payload: &[u8]) {
    let length = payload.len() as u32 + 1;
    out.push(protocol);
    out.extend_from_slice(&length.to_le_bytes());
    out.push(opcode);
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_round_trip() {
        let mut out = Vec::new();
        write_frame(&mut out, PROTO_EDONKEY, 0x01, &[1, 2, 3]);
        assert_eq!(out.len(), FRAME_HEADER_LEN + 3);
        let (hdr, opcode) = FrameHeader::parse(out[..6].try_into().unwrap()).unwrap();
        assert_eq!(hdr.protocol, PROTO_EDONKEY);
        assert_eq!(hdr.length, 4);
        assert_eq!(hdr.payload_len(), 3);
        assert_eq!(opcode, 0x01);
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let buf = [0x42u8, 1, 0, 0, 0, 0x01];
        assert!(matches!(
            FrameHeader::parse(&buf),
            Err(MessageDeserializeError::UnsupportedProtocolType(0x42))
        ));
    }

    #[test]
    fn test_rejects_oversize_frame() {
        let mut buf = [0u8; 6];
        buf[0] = PROTO_EDONKEY;
        LE::write_u32(&mut buf[1..5], MAX_FRAME_SIZE + 1);
        assert!(matches!(
            FrameHeader::parse(&buf),
            Err(MessageDeserializeError::InvalidPacketSize(_))
        ));
    }

    #[test]
    fn test_rejects_zero_length() {
        let mut buf = [0u8; 6];
        buf[0] = PROTO_EDONKEY;
        assert!(matches!(
            FrameHeader::parse(&buf),
            Err(MessageDeserializeError::InvalidPacketSize(0))
        ));
    }
}
