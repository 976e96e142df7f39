// Client <-> index server messages.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use libed2k_core::hash_id::Md4Hash;

use crate::reader::{write_u16_string, Reader};
use crate::tags::{read_tag_list, write_tag_list, Tag};
use crate::{write_frame, MessageDeserializeError, PROTO_EDONKEY};

pub const OP_LOGINREQUEST: u8 = 0x01;
pub const OP_REJECT: u8 = 0x05;
pub const OP_GETSERVERLIST: u8 = 0x14;
pub const OP_OFFERFILES: u8 = 0x15;
pub const OP_SEARCHREQUEST: u8 = 0x16;
pub const OP_GETSOURCES: u8 = 0x19;
pub const OP_CALLBACKREQUEST: u8 = 0x1C;
pub const OP_SERVERLIST: u8 = 0x32;
pub const OP_SEARCHRESULT: u8 = 0x33;
pub const OP_SERVERSTATUS: u8 = 0x34;
pub const OP_CALLBACKREQUESTED: u8 = 0x35;
pub const OP_CALLBACK_FAIL: u8 = 0x36;
pub const OP_SERVERMESSAGE: u8 = 0x38;
pub const OP_IDCHANGE: u8 = 0x40;
pub const OP_SERVERIDENT: u8 = 0x41;
pub const OP_FOUNDSOURCES: u8 = 0x42;

/// An ip/port pair as it travels on the wire: the ip is 4 raw octets, which
/// read as a little-endian u32 put the first octet in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetEndpoint {
    pub ip: u32,
    pub port: u16,
}

impl NetEndpoint {
    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(self.ip.to_le_bytes()),
            self.port,
        ))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Option<NetEndpoint> {
        match addr {
            SocketAddr::V4(v4) => Some(NetEndpoint {
                ip: u32::from_le_bytes(v4.ip().octets()),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => None,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ip.to_le_bytes());
        out.extend_from_slice(&self.port.to_le_bytes());
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, MessageDeserializeError> {
        Ok(NetEndpoint {
            ip: r.read_u32()?,
            port: r.read_u16()?,
        })
    }
}

/// One published or found file: the shape is shared by offer-files and
/// search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedFileEntry {
    pub hash: Md4Hash,
    pub client_id: u32,
    pub port: u16,
    pub tags: Vec<Tag>,
}

impl SharedFileEntry {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash.0);
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.port.to_le_bytes());
        write_tag_list(out, &self.tags);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, MessageDeserializeError> {
        Ok(SharedFileEntry {
            hash: r.read_hash()?,
            client_id: r.read_u32()?,
            port: r.read_u16()?,
            tags: read_tag_list(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginRequest {
    pub client_hash: Md4Hash,
    pub client_id: u32,
    pub port: u16,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    LoginRequest(LoginRequest),
    Reject,
    GetServerList,
    OfferFiles(Vec<SharedFileEntry>),
    /// Baseline string search term.
    SearchRequest(String),
    SearchResult(Vec<SharedFileEntry>),
    GetSources {
        hash: Md4Hash,
    },
    FoundSources {
        hash: Md4Hash,
        sources: Vec<NetEndpoint>,
    },
    /// Ask the server to relay a connect-back request to a LowID peer.
    CallbackRequest {
        client_id: u32,
    },
    /// A LowID peer we should connect out to because it cannot reach us.
    CallbackRequested(NetEndpoint),
    CallbackFailed,
    ServerText(String),
    ServerStatus {
        users: u32,
        files: u32,
    },
    IdChange {
        client_id: u32,
        tcp_flags: u32,
    },
    ServerIdent {
        hash: Md4Hash,
        endpoint: NetEndpoint,
        tags: Vec<Tag>,
    },
    ServerList(Vec<NetEndpoint>),
}

impl ServerMessage {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        let opcode = match self {
            ServerMessage::LoginRequest(login) => {
                payload.extend_from_slice(&login.client_hash.0);
                payload.extend_from_slice(&login.client_id.to_le_bytes());
                payload.extend_from_slice(&login.port.to_le_bytes());
                write_tag_list(&mut payload, &login.tags);
                OP_LOGINREQUEST
            }
            ServerMessage::Reject => OP_REJECT,
            ServerMessage::GetServerList => OP_GETSERVERLIST,
            ServerMessage::OfferFiles(files) => {
                payload.extend_from_slice(&(files.len() as u32).to_le_bytes());
                for f in files {
                    f.write(&mut payload);
                }
                OP_OFFERFILES
            }
            ServerMessage::SearchRequest(query) => {
                // A single string term of the search expression grammar.
                payload.push(0x01);
                write_u16_string(&mut payload, query);
                OP_SEARCHREQUEST
            }
            ServerMessage::SearchResult(results) => {
                payload.extend_from_slice(&(results.len() as u32).to_le_bytes());
                for f in results {
                    f.write(&mut payload);
                }
                OP_SEARCHRESULT
            }
            ServerMessage::GetSources { hash } => {
                payload.extend_from_slice(&hash.0);
                OP_GETSOURCES
            }
            ServerMessage::FoundSources { hash, sources } => {
                payload.extend_from_slice(&hash.0);
                payload.push(sources.len() as u8);
                for s in sources {
                    s.write(&mut payload);
                }
                OP_FOUNDSOURCES
            }
            ServerMessage::CallbackRequest { client_id } => {
                payload.extend_from_slice(&client_id.to_le_bytes());
                OP_CALLBACKREQUEST
            }
            ServerMessage::CallbackRequested(endpoint) => {
                endpoint.write(&mut payload);
                OP_CALLBACKREQUESTED
            }
            ServerMessage::CallbackFailed => OP_CALLBACK_FAIL,
            ServerMessage::ServerText(text) => {
                write_u16_string(&mut payload, text);
                OP_SERVERMESSAGE
            }
            ServerMessage::ServerStatus { users, files } => {
                payload.extend_from_slice(&users.to_le_bytes());
                payload.extend_from_slice(&files.to_le_bytes());
                OP_SERVERSTATUS
            }
            ServerMessage::IdChange {
                client_id,
                tcp_flags,
            } => {
                payload.extend_from_slice(&client_id.to_le_bytes());
                payload.extend_from_slice(&tcp_flags.to_le_bytes());
                OP_IDCHANGE
            }
            ServerMessage::ServerIdent {
                hash,
                endpoint,
                tags,
            } => {
                payload.extend_from_slice(&hash.0);
                endpoint.write(&mut payload);
                write_tag_list(&mut payload, tags);
                OP_SERVERIDENT
            }
            ServerMessage::ServerList(servers) => {
                payload.push(servers.len() as u8);
                for s in servers {
                    s.write(&mut payload);
                }
                OP_SERVERLIST
            }
        };
        write_frame(out, PROTO_EDONKEY, opcode, &payload);
    }

    pub fn deserialize(
        protocol: u8,
        opcode: u8,
        payload: &[u8],
    ) -> Result<ServerMessage, MessageDeserializeError> {
        if protocol != PROTO_EDONKEY {
            return Err(MessageDeserializeError::UnsupportedProtocolType(protocol));
        }
        let mut r = Reader::new(payload);
        let msg = match opcode {
            OP_LOGINREQUEST => ServerMessage::LoginRequest(LoginRequest {
                client_hash: r.read_hash()?,
                client_id: r.read_u32()?,
                port: r.read_u16()?,
                tags: read_tag_list(&mut r)?,
            }),
            OP_REJECT => ServerMessage::Reject,
            OP_GETSERVERLIST => ServerMessage::GetServerList,
            OP_OFFERFILES => {
                let count = r.read_u32()?;
                let mut files = Vec::with_capacity((count as usize).min(1024));
                for _ in 0..count {
                    files.push(SharedFileEntry::read(&mut r)?);
                }
                ServerMessage::OfferFiles(files)
            }
            OP_SEARCHREQUEST => {
                let term_type = r.read_u8()?;
                if term_type != 0x01 {
                    return Err(MessageDeserializeError::InvalidOpcode { protocol, opcode });
                }
                ServerMessage::SearchRequest(r.read_u16_string()?)
            }
            OP_SEARCHRESULT => {
                let count = r.read_u32()?;
                let mut results = Vec::with_capacity((count as usize).min(1024));
                for _ in 0..count {
                    results.push(SharedFileEntry::read(&mut r)?);
                }
                ServerMessage::SearchResult(results)
            }
            OP_GETSOURCES => ServerMessage::GetSources {
                hash: r.read_hash()?,
            },
            OP_FOUNDSOURCES => {
                let hash = r.read_hash()?;
                let count = r.read_u8()?;
                let mut sources = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    sources.push(NetEndpoint::read(&mut r)?);
                }
                ServerMessage::FoundSources { hash, sources }
            }
            OP_CALLBACKREQUEST => ServerMessage::CallbackRequest {
                client_id: r.read_u32()?,
            },
            OP_CALLBACKREQUESTED => ServerMessage::CallbackRequested(NetEndpoint::read(&mut r)?),
            OP_CALLBACK_FAIL => ServerMessage::CallbackFailed,
            OP_SERVERMESSAGE => ServerMessage::ServerText(r.read_u16_string()?),
            OP_SERVERSTATUS => ServerMessage::ServerStatus {
                users: r.read_u32()?,
                files: r.read_u32()?,
            },
            OP_IDCHANGE => {
                let client_id = r.read_u32()?;
                // Older servers omit the flags word.
                let tcp_flags = if r.remaining() >= 4 { r.read_u32()? } else { 0 };
                ServerMessage::IdChange {
                    client_id,
                    tcp_flags,
                }
            }
            OP_SERVERIDENT => ServerMessage::ServerIdent {
                hash: r.read_hash()?,
                endpoint: NetEndpoint::read(&mut r)?,
                tags: read_tag_list(&mut r)?,
            },
            OP_SERVERLIST => {
                let count = r.read_u8()?;
                let mut servers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    servers.push(NetEndpoint::read(&mut r)?);
                }
                ServerMessage::ServerList(servers)
            }
            opcode => return Err(MessageDeserializeError::InvalidOpcode { protocol, opcode }),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{CT_NAME, CT_PORT, CT_VERSION};
    use crate::FrameHeader;

    fn round_trip(msg: ServerMessage) -> ServerMessage {
        let mut out = Vec::new();
        msg.serialize(&mut out);
        let (hdr, opcode) = FrameHeader::parse(out[..6].try_into().unwrap()).unwrap();
        let payload = &out[6..];
        assert_eq!(hdr.payload_len(), payload.len());
        ServerMessage::deserialize(hdr.protocol, opcode, payload).unwrap()
    }

    #[test]
    fn test_login_round_trip() {
        let msg = ServerMessage::LoginRequest(LoginRequest {
            client_hash: Md4Hash::default_client_hash(),
            client_id: 0,
            port: 4662,
            tags: vec![
                Tag::string(CT_NAME, "libed2k"),
                Tag::u32(CT_VERSION, 0x3C),
                Tag::u32(CT_PORT, 4662),
            ],
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_status_and_idchange_round_trip() {
        let msg = ServerMessage::ServerStatus {
            users: 1000,
            files: 2_000_000,
        };
        assert_eq!(round_trip(msg.clone()), msg);
        let msg = ServerMessage::IdChange {
            client_id: 0x00FFFFFF,
            tcp_flags: 0x0001,
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_idchange_without_flags() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&77u32.to_le_bytes());
        let msg = ServerMessage::deserialize(PROTO_EDONKEY, OP_IDCHANGE, &payload).unwrap();
        assert_eq!(
            msg,
            ServerMessage::IdChange {
                client_id: 77,
                tcp_flags: 0
            }
        );
    }

    #[test]
    fn test_sources_round_trip() {
        let msg = ServerMessage::FoundSources {
            hash: Md4Hash::TERMINAL,
            sources: vec![
                NetEndpoint {
                    ip: u32::from_le_bytes([10, 0, 0, 1]),
                    port: 4662,
                },
                NetEndpoint {
                    ip: u32::from_le_bytes([192, 168, 1, 2]),
                    port: 7000,
                },
            ],
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_endpoint_octet_order() {
        let ep = NetEndpoint {
            ip: u32::from_le_bytes([10, 11, 12, 13]),
            port: 4662,
        };
        assert_eq!(ep.to_socket_addr().to_string(), "10.11.12.13:4662");
        assert_eq!(
            NetEndpoint::from_socket_addr(ep.to_socket_addr()),
            Some(ep)
        );
    }

    #[test]
    fn test_search_round_trip() {
        let msg = ServerMessage::SearchRequest("ubuntu iso".to_owned());
        assert_eq!(round_trip(msg.clone()), msg);
        let msg = ServerMessage::SearchResult(vec![SharedFileEntry {
            hash: Md4Hash::TERMINAL,
            client_id: 42,
            port: 4662,
            tags: vec![Tag::string(crate::tags::FT_FILENAME, "x.iso")],
        }]);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(matches!(
            ServerMessage::deserialize(PROTO_EDONKEY, 0x7F, &[]),
            Err(MessageDeserializeError::InvalidOpcode { .. })
        ));
    }

    #[test]
    fn test_wrong_protocol_rejected() {
        assert!(matches!(
            ServerMessage::deserialize(crate::PROTO_PACKED, OP_SERVERMESSAGE, &[]),
            Err(MessageDeserializeError::UnsupportedProtocolType(_))
        ));
    }
}
