// Peer <-> peer messages: handshake, file negotiation, part transfer.

use bytes::Bytes;
use libed2k_core::hash_id::Md4Hash;

use crate::reader::{write_u16_string, Reader};
use crate::server::NetEndpoint;
use crate::tags::{read_tag_list, write_tag_list, Tag};
use crate::{write_frame, MessageDeserializeError, PROTO_EDONKEY, PROTO_EMULE};

pub const OP_HELLO: u8 = 0x01;
pub const OP_SENDINGPART: u8 = 0x46;
pub const OP_REQUESTPARTS: u8 = 0x47;
pub const OP_NOFILE: u8 = 0x48;
pub const OP_END_OF_DOWNLOAD: u8 = 0x49;
pub const OP_HELLOANSWER: u8 = 0x4C;
pub const OP_MESSAGE: u8 = 0x4E;
pub const OP_SETREQFILEID: u8 = 0x4F;
pub const OP_FILESTATUS: u8 = 0x50;
pub const OP_HASHSETREQUEST: u8 = 0x51;
pub const OP_HASHSETANSWER: u8 = 0x52;
pub const OP_STARTUPLOADREQ: u8 = 0x54;
pub const OP_ACCEPTUPLOADREQ: u8 = 0x55;
pub const OP_CANCELTRANSFER: u8 = 0x56;
pub const OP_OUTOFPARTREQS: u8 = 0x57;
pub const OP_REQUESTFILENAME: u8 = 0x58;
pub const OP_REQFILENAMEANSWER: u8 = 0x59;
pub const OP_QUEUERANK: u8 = 0x5C;

// eMule-extended opcodes (protocol 0xC5) for offsets beyond 4 GiB.
pub const OP_SENDINGPART_I64: u8 = 0xA1;
pub const OP_REQUESTPARTS_I64: u8 = 0xA3;

/// Both sides announce themselves with this before anything else. The tag
/// list carries the client name, version and extension flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub client_hash: Md4Hash,
    pub client_id: u32,
    pub port: u16,
    pub tags: Vec<Tag>,
    pub server: NetEndpoint,
}

impl Hello {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.client_hash.0);
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.port.to_le_bytes());
        write_tag_list(out, &self.tags);
        out.extend_from_slice(&self.server.ip.to_le_bytes());
        out.extend_from_slice(&self.server.port.to_le_bytes());
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, MessageDeserializeError> {
        Ok(Hello {
            client_hash: r.read_hash()?,
            client_id: r.read_u32()?,
            port: r.read_u16()?,
            tags: read_tag_list(r)?,
            server: NetEndpoint {
                ip: r.read_u32()?,
                port: r.read_u16()?,
            },
        })
    }
}

/// A half-open byte range `[begin, end)` of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub begin: u64,
    pub end: u64,
}

/// Per-piece have bits as they travel in a file-status message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBitfield {
    pub bits: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Hello(Hello),
    HelloAnswer(Hello),
    /// Ask for the name of a file we only know by hash.
    FileRequest { hash: Md4Hash },
    FileAnswer { hash: Md4Hash, name: String },
    NoFile { hash: Md4Hash },
    /// Bind the connection to a file and ask for its piece status.
    SetRequestFileId { hash: Md4Hash },
    FileStatus { hash: Md4Hash, pieces: WireBitfield },
    HashSetRequest { hash: Md4Hash },
    HashSetAnswer { hash: Md4Hash, pieces: Vec<Md4Hash> },
    /// Reserve an upload slot ("set request queue").
    StartUploadRequest { hash: Md4Hash },
    AcceptUpload,
    QueueRanking { rank: u32 },
    OutOfPartRequests,
    CancelTransfer,
    /// Up to three block ranges per request.
    RequestParts { hash: Md4Hash, ranges: Vec<PartRange> },
    SendingPart { hash: Md4Hash, begin: u64, data: Bytes },
    EndOfDownload { hash: Md4Hash },
    Chat { text: String },
}

const REQUEST_RANGES: usize = 3;

fn ranges_fit_u32(ranges: &[PartRange]) -> bool {
    ranges.iter().all(|r| r.end <= u32::MAX as u64)
}

impl PeerMessage {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        let (protocol, opcode) = match self {
            PeerMessage::Hello(hello) => {
                // The hello opcode collides with the server login opcode;
                // the hash-size byte disambiguates the stream.
                payload.push(16);
                hello.write(&mut payload);
                (PROTO_EDONKEY, OP_HELLO)
            }
            PeerMessage::HelloAnswer(hello) => {
                hello.write(&mut payload);
                (PROTO_EDONKEY, OP_HELLOANSWER)
            }
            PeerMessage::FileRequest { hash } => {
                payload.extend_from_slice(&hash.0);
                (PROTO_EDONKEY, OP_REQUESTFILENAME)
            }
            PeerMessage::FileAnswer { hash, name } => {
                payload.extend_from_slice(&hash.0);
                write_u16_string(&mut payload, name);
                (PROTO_EDONKEY, OP_REQFILENAMEANSWER)
            }
            PeerMessage::NoFile { hash } => {
                payload.extend_from_slice(&hash.0);
                (PROTO_EDONKEY, OP_NOFILE)
            }
            PeerMessage::SetRequestFileId { hash } => {
                payload.extend_from_slice(&hash.0);
                (PROTO_EDONKEY, OP_SETREQFILEID)
            }
            PeerMessage::FileStatus { hash, pieces } => {
                payload.extend_from_slice(&hash.0);
                payload.extend_from_slice(&pieces.bits.to_le_bytes());
                payload.extend_from_slice(&pieces.data);
                (PROTO_EDONKEY, OP_FILESTATUS)
            }
            PeerMessage::HashSetRequest { hash } => {
                payload.extend_from_slice(&hash.0);
                (PROTO_EDONKEY, OP_HASHSETREQUEST)
            }
            PeerMessage::HashSetAnswer { hash, pieces } => {
                payload.extend_from_slice(&hash.0);
                payload.extend_from_slice(&(pieces.len() as u16).to_le_bytes());
                for p in pieces {
                    payload.extend_from_slice(&p.0);
                }
                (PROTO_EDONKEY, OP_HASHSETANSWER)
            }
            PeerMessage::StartUploadRequest { hash } => {
                payload.extend_from_slice(&hash.0);
                (PROTO_EDONKEY, OP_STARTUPLOADREQ)
            }
            PeerMessage::AcceptUpload => (PROTO_EDONKEY, OP_ACCEPTUPLOADREQ),
            PeerMessage::QueueRanking { rank } => {
                payload.extend_from_slice(&rank.to_le_bytes());
                (PROTO_EDONKEY, OP_QUEUERANK)
            }
            PeerMessage::OutOfPartRequests => (PROTO_EDONKEY, OP_OUTOFPARTREQS),
            PeerMessage::CancelTransfer => (PROTO_EDONKEY, OP_CANCELTRANSFER),
            PeerMessage::RequestParts { hash, ranges } => {
                debug_assert!(!ranges.is_empty() && ranges.len() <= REQUEST_RANGES);
                payload.extend_from_slice(&hash.0);
                if ranges_fit_u32(ranges) {
                    for i in 0..REQUEST_RANGES {
                        let begin = ranges.get(i).map_or(0, |r| r.begin as u32);
                        payload.extend_from_slice(&begin.to_le_bytes());
                    }
                    for i in 0..REQUEST_RANGES {
                        let end = ranges.get(i).map_or(0, |r| r.end as u32);
                        payload.extend_from_slice(&end.to_le_bytes());
                    }
                    (PROTO_EDONKEY, OP_REQUESTPARTS)
                } else {
                    for i in 0..REQUEST_RANGES {
                        let begin = ranges.get(i).map_or(0, |r| r.begin);
                        payload.extend_from_slice(&begin.to_le_bytes());
                    }
                    for i in 0..REQUEST_RANGES {
                        let end = ranges.get(i).map_or(0, |r| r.end);
                        payload.extend_from_slice(&end.to_le_bytes());
                    }
                    (PROTO_EMULE, OP_REQUESTPARTS_I64)
                }
            }
            PeerMessage::SendingPart { hash, begin, data } => {
                payload.extend_from_slice(&hash.0);
                let end = begin + data.len() as u64;
                if end <= u32::MAX as u64 {
                    payload.extend_from_slice(&(*begin as u32).to_le_bytes());
                    payload.extend_from_slice(&(end as u32).to_le_bytes());
                    payload.extend_from_slice(data);
                    (PROTO_EDONKEY, OP_SENDINGPART)
                } else {
                    payload.extend_from_slice(&begin.to_le_bytes());
                    payload.extend_from_slice(&end.to_le_bytes());
                    payload.extend_from_slice(data);
                    (PROTO_EMULE, OP_SENDINGPART_I64)
                }
            }
            PeerMessage::EndOfDownload { hash } => {
                payload.extend_from_slice(&hash.0);
                (PROTO_EDONKEY, OP_END_OF_DOWNLOAD)
            }
            PeerMessage::Chat { text } => {
                write_u16_string(&mut payload, text);
                (PROTO_EDONKEY, OP_MESSAGE)
            }
        };
        write_frame(out, protocol, opcode, &payload);
    }

    pub fn deserialize(
        protocol: u8,
        opcode: u8,
        payload: &[u8],
    ) -> Result<PeerMessage, MessageDeserializeError> {
        let mut r = Reader::new(payload);
        let msg = match (protocol, opcode) {
            (PROTO_EDONKEY, OP_HELLO) => {
                let hash_size = r.read_u8()?;
                if hash_size != 16 {
                    return Err(MessageDeserializeError::InvalidOpcode { protocol, opcode });
                }
                PeerMessage::Hello(Hello::read(&mut r)?)
            }
            (PROTO_EDONKEY, OP_HELLOANSWER) => PeerMessage::HelloAnswer(Hello::read(&mut r)?),
            (PROTO_EDONKEY, OP_REQUESTFILENAME) => PeerMessage::FileRequest {
                hash: r.read_hash()?,
            },
            (PROTO_EDONKEY, OP_REQFILENAMEANSWER) => PeerMessage::FileAnswer {
                hash: r.read_hash()?,
                name: r.read_u16_string()?,
            },
            (PROTO_EDONKEY, OP_NOFILE) => PeerMessage::NoFile {
                hash: r.read_hash()?,
            },
            (PROTO_EDONKEY, OP_SETREQFILEID) => PeerMessage::SetRequestFileId {
                hash: r.read_hash()?,
            },
            (PROTO_EDONKEY, OP_FILESTATUS) => {
                let hash = r.read_hash()?;
                let bits = r.read_u16()?;
                let data = r.read_exact((bits as usize).div_ceil(8))?.to_vec();
                PeerMessage::FileStatus {
                    hash,
                    pieces: WireBitfield { bits, data },
                }
            }
            (PROTO_EDONKEY, OP_HASHSETREQUEST) => PeerMessage::HashSetRequest {
                hash: r.read_hash()?,
            },
            (PROTO_EDONKEY, OP_HASHSETANSWER) => {
                let hash = r.read_hash()?;
                let count = r.read_u16()?;
                let mut pieces = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    pieces.push(r.read_hash()?);
                }
                PeerMessage::HashSetAnswer { hash, pieces }
            }
            (PROTO_EDONKEY, OP_STARTUPLOADREQ) => PeerMessage::StartUploadRequest {
                hash: r.read_hash()?,
            },
            (PROTO_EDONKEY, OP_ACCEPTUPLOADREQ) => PeerMessage::AcceptUpload,
            (PROTO_EDONKEY, OP_QUEUERANK) => PeerMessage::QueueRanking {
                rank: r.read_u32()?,
            },
            (PROTO_EDONKEY, OP_OUTOFPARTREQS) => PeerMessage::OutOfPartRequests,
            (PROTO_EDONKEY, OP_CANCELTRANSFER) => PeerMessage::CancelTransfer,
            (PROTO_EDONKEY, OP_REQUESTPARTS) | (PROTO_EMULE, OP_REQUESTPARTS_I64) => {
                let hash = r.read_hash()?;
                let wide = opcode == OP_REQUESTPARTS_I64;
                let mut begins = [0u64; REQUEST_RANGES];
                let mut ends = [0u64; REQUEST_RANGES];
                for b in begins.iter_mut() {
                    *b = if wide { r.read_u64()? } else { r.read_u32()? as u64 };
                }
                for e in ends.iter_mut() {
                    *e = if wide { r.read_u64()? } else { r.read_u32()? as u64 };
                }
                let mut ranges = Vec::new();
                for (begin, end) in begins.into_iter().zip(ends) {
                    if begin == end {
                        continue;
                    }
                    if begin > end {
                        return Err(MessageDeserializeError::InvalidPartRanges);
                    }
                    ranges.push(PartRange { begin, end });
                }
                if ranges.is_empty() {
                    return Err(MessageDeserializeError::InvalidPartRanges);
                }
                PeerMessage::RequestParts { hash, ranges }
            }
            (PROTO_EDONKEY, OP_SENDINGPART) | (PROTO_EMULE, OP_SENDINGPART_I64) => {
                let hash = r.read_hash()?;
                let wide = opcode == OP_SENDINGPART_I64;
                let begin = if wide { r.read_u64()? } else { r.read_u32()? as u64 };
                let end = if wide { r.read_u64()? } else { r.read_u32()? as u64 };
                if end <= begin || end - begin != r.remaining() as u64 {
                    return Err(MessageDeserializeError::InvalidPartRanges);
                }
                let data = Bytes::copy_from_slice(r.read_exact(r.remaining())?);
                PeerMessage::SendingPart { hash, begin, data }
            }
            (PROTO_EDONKEY, OP_END_OF_DOWNLOAD) => PeerMessage::EndOfDownload {
                hash: r.read_hash()?,
            },
            (PROTO_EDONKEY, OP_MESSAGE) => PeerMessage::Chat {
                text: r.read_u16_string()?,
            },
            (protocol, opcode) => {
                return Err(MessageDeserializeError::InvalidOpcode { protocol, opcode })
            }
        };
        Ok(msg)
    }
}
