//! The wire protocol: a binary, CRC-checked envelope and the typed
//! messages exchanged between Chord peers (spec.md §4.4/§6).
//!
//! Replaces the teacher's bracketed text protocol
//! (`chord::protocol::{ChordRequest, ChordResponse}`, parsed with `regex`)
//! with a fixed binary envelope, while keeping the teacher's message
//! catalogue: `FindSuccessorOfNode`/`GetSuccessorList`/`GetPredecessor`/
//! `NotificationBy`/`CheckNode` map onto `JOIN_REQ`/`INFO_REQ`/`NOTIFY_REQ`/
//! `PING` here, carrying the same information as structured binary
//! payloads instead of bracketed, comma-joined text.

pub mod correlator;

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};

use crate::errors::{FrameError, ProtocolError};
use crate::identifier::{Identifier, HASHLEN};

const MAGIC_PREFIX: [u8; 4] = *b"CHRD";
const MAGIC_SUFFIX: [u8; 4] = *b"DRHC";
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum payload length accepted from the wire (bounded per-connection
/// resource, spec.md §5).
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum MessageType {
    JoinReq = 1,
    JoinResp = 2,
    NotifyReq = 3,
    NotifyResp = 4,
    InfoReq = 5,
    InfoResp = 6,
    Ping = 7,
    Pong = 8,
}

impl MessageType {
    /// Whether this type is the response half of a request/response pair.
    /// Used by the correlator to tell a late, already-timed-out response
    /// apart from a fresh unsolicited request sharing the same corr_id
    /// space.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::JoinResp | Self::NotifyResp | Self::InfoResp | Self::Pong)
    }

    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::JoinReq,
            2 => Self::JoinResp,
            3 => Self::NotifyReq,
            4 => Self::NotifyResp,
            5 => Self::InfoReq,
            6 => Self::InfoResp,
            7 => Self::Ping,
            8 => Self::Pong,
            _ => return None,
        })
    }
}

/// A typed Chord protocol message, independent of its corr_id (the
/// correlator layer owns that).
#[derive(Clone, Debug)]
pub enum Message {
    JoinReq {
        listener_addr: SocketAddr,
    },
    JoinResp {
        node_hash: Identifier,
        listener_addr: SocketAddr,
    },
    NotifyReq,
    NotifyResp {
        node_hash: Identifier,
        successor_listener_addr: SocketAddr,
        predecessor_listener_addr: SocketAddr,
    },
    InfoReq,
    InfoResp {
        node_hash: Identifier,
        successor_listener_addr: SocketAddr,
        predecessor_listener_addr: SocketAddr,
    },
    Ping,
    Pong,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::JoinReq { .. } => MessageType::JoinReq,
            Self::JoinResp { .. } => MessageType::JoinResp,
            Self::NotifyReq => MessageType::NotifyReq,
            Self::NotifyResp { .. } => MessageType::NotifyResp,
            Self::InfoReq => MessageType::InfoReq,
            Self::InfoResp { .. } => MessageType::InfoResp,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::JoinReq { listener_addr } => encode_addr(*listener_addr),
            Self::JoinResp {
                node_hash,
                listener_addr,
            } => {
                let mut buf = node_hash.as_bytes().to_vec();
                buf.extend(encode_addr(*listener_addr));
                buf
            }
            Self::NotifyReq | Self::InfoReq | Self::Ping | Self::Pong => Vec::new(),
            Self::NotifyResp {
                node_hash,
                successor_listener_addr,
                predecessor_listener_addr,
            }
            | Self::InfoResp {
                node_hash,
                successor_listener_addr,
                predecessor_listener_addr,
            } => {
                let mut buf = node_hash.as_bytes().to_vec();
                buf.extend(encode_addr(*successor_listener_addr));
                buf.extend(encode_addr(*predecessor_listener_addr));
                buf
            }
        }
    }

    fn decode_payload(ty: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedPayload(ty);
        match ty {
            MessageType::JoinReq => {
                let (listener_addr, _) = decode_addr(payload).ok_or_else(malformed)?;
                Ok(Self::JoinReq { listener_addr })
            }
            MessageType::JoinResp => {
                let node_hash = decode_hash(payload).ok_or(ProtocolError::Frame(FrameError::BadHash))?;
                let (listener_addr, _) = decode_addr(&payload[HASHLEN..]).ok_or_else(malformed)?;
                Ok(Self::JoinResp {
                    node_hash,
                    listener_addr,
                })
            }
            MessageType::NotifyReq => Ok(Self::NotifyReq),
            MessageType::InfoReq => Ok(Self::InfoReq),
            MessageType::Ping => Ok(Self::Ping),
            MessageType::Pong => Ok(Self::Pong),
            MessageType::NotifyResp | MessageType::InfoResp => {
                let node_hash = decode_hash(payload).ok_or(ProtocolError::Frame(FrameError::BadHash))?;
                let rest = &payload[HASHLEN..];
                let (successor_listener_addr, consumed) = decode_addr(rest).ok_or_else(malformed)?;
                let (predecessor_listener_addr, _) =
                    decode_addr(&rest[consumed..]).ok_or_else(malformed)?;
                if ty == MessageType::NotifyResp {
                    Ok(Self::NotifyResp {
                        node_hash,
                        successor_listener_addr,
                        predecessor_listener_addr,
                    })
                } else {
                    Ok(Self::InfoResp {
                        node_hash,
                        successor_listener_addr,
                        predecessor_listener_addr,
                    })
                }
            }
        }
    }
}

fn decode_hash(payload: &[u8]) -> Option<Identifier> {
    if payload.len() < HASHLEN {
        return None;
    }
    let bytes: [u8; HASHLEN] = payload[..HASHLEN].try_into().ok()?;
    Some(Identifier::from_bytes(bytes))
}

/// `(host_string_length u8, host_bytes, port u16)`.
fn encode_addr(addr: SocketAddr) -> Vec<u8> {
    let host = addr.ip().to_string();
    let mut buf = Vec::with_capacity(1 + host.len() + 2);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(&addr.port().to_be_bytes());
    buf
}

/// Decodes `(host_string_length u8, host_bytes, port u16)`, returning the
/// address and the number of bytes consumed.
fn decode_addr(payload: &[u8]) -> Option<(SocketAddr, usize)> {
    let host_len = *payload.first()? as usize;
    if payload.len() < 1 + host_len + 2 {
        return None;
    }
    let host = std::str::from_utf8(&payload[1..1 + host_len]).ok()?;
    let ip: IpAddr = host.parse().ok()?;
    let port_bytes: [u8; 2] = payload[1 + host_len..3 + host_len].try_into().ok()?;
    let port = u16::from_be_bytes(port_bytes);
    Some((SocketAddr::new(ip, port), 3 + host_len))
}

/// Computes the CRC32 over everything between the magic prefix and the
/// checksum field: version, type, corr_id, length, payload.
fn compute_crc(version: u16, msg_type: u16, corr_id: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_be_bytes());
    hasher.update(&msg_type.to_be_bytes());
    hasher.update(&corr_id.to_be_bytes());
    hasher.update(&(payload.len() as u32).to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Writes `message` framed as an envelope with the given correlation id.
pub fn write_frame<W: Write>(writer: &mut W, corr_id: u32, message: &Message) -> io::Result<()> {
    let payload = message.encode_payload();
    let msg_type = message.message_type() as u16;
    let crc = compute_crc(PROTOCOL_VERSION, msg_type, corr_id, &payload);

    writer.write_all(&MAGIC_PREFIX)?;
    writer.write_all(&PROTOCOL_VERSION.to_be_bytes())?;
    writer.write_all(&msg_type.to_be_bytes())?;
    writer.write_all(&corr_id.to_be_bytes())?;
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_be_bytes())?;
    writer.write_all(&MAGIC_SUFFIX)?;
    writer.flush()
}

/// Reads and validates a single envelope, returning its correlation id and
/// decoded message.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(u32, Message), ProtocolError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).map_err(frame_io_or_too_short)?;
    if prefix != MAGIC_PREFIX {
        return Err(FrameError::NoPrefix.into());
    }

    let mut header = [0u8; 2 + 2 + 4 + 4];
    reader
        .read_exact(&mut header)
        .map_err(frame_io_or_too_short)?;

    let version = u16::from_be_bytes([header[0], header[1]]);
    if version != PROTOCOL_VERSION {
        return Err(FrameError::WrongVersion {
            found: version,
            expected: PROTOCOL_VERSION,
        }
        .into());
    }

    let msg_type_raw = u16::from_be_bytes([header[2], header[3]]);
    let corr_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let declared_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if declared_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::WrongLength {
            declared: declared_len,
            actual: 0,
        }
        .into());
    }

    let mut payload = vec![0u8; declared_len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(frame_io_or_too_short)?;

    let mut crc_bytes = [0u8; 4];
    reader
        .read_exact(&mut crc_bytes)
        .map_err(frame_io_or_too_short)?;
    let crc = u32::from_be_bytes(crc_bytes);

    let mut suffix = [0u8; 4];
    reader
        .read_exact(&mut suffix)
        .map_err(frame_io_or_too_short)?;
    if suffix != MAGIC_SUFFIX {
        return Err(FrameError::NoSuffix.into());
    }

    let expected_crc = compute_crc(version, msg_type_raw, corr_id, &payload);
    if crc != expected_crc {
        return Err(FrameError::BadChecksum.into());
    }

    let msg_type = MessageType::from_u16(msg_type_raw)
        .ok_or(ProtocolError::UnknownMessageType(msg_type_raw))?;
    let message = Message::decode_payload(msg_type, &payload)?;

    Ok((corr_id, message))
}

fn frame_io_or_too_short(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::TooShort.into()
    } else {
        FrameError::Io(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = Vec::new();
        write_frame(&mut buf, 42, &msg).unwrap();
        let mut cursor = Cursor::new(buf);
        let (corr_id, decoded) = read_frame(&mut cursor).unwrap();
        assert_eq!(corr_id, 42);
        decoded
    }

    #[test]
    fn join_req_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:2017".parse().unwrap();
        match roundtrip(Message::JoinReq { listener_addr: addr }) {
            Message::JoinReq { listener_addr } => assert_eq!(listener_addr, addr),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn join_resp_roundtrip_ipv6() {
        let addr: SocketAddr = "[2001:db8::1]:4040".parse().unwrap();
        let hash = Identifier::from_int(0xabc);
        match roundtrip(Message::JoinResp {
            node_hash: hash,
            listener_addr: addr,
        }) {
            Message::JoinResp {
                node_hash,
                listener_addr,
            } => {
                assert_eq!(node_hash, hash);
                assert_eq!(listener_addr, addr);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn notify_resp_roundtrip() {
        let succ: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let pred: SocketAddr = "10.0.0.2:2".parse().unwrap();
        let hash = Identifier::from_int(7);
        match roundtrip(Message::NotifyResp {
            node_hash: hash,
            successor_listener_addr: succ,
            predecessor_listener_addr: pred,
        }) {
            Message::NotifyResp {
                node_hash,
                successor_listener_addr,
                predecessor_listener_addr,
            } => {
                assert_eq!(node_hash, hash);
                assert_eq!(successor_listener_addr, succ);
                assert_eq!(predecessor_listener_addr, pred);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn empty_payload_messages_roundtrip() {
        assert!(matches!(roundtrip(Message::InfoReq), Message::InfoReq));
        assert!(matches!(roundtrip(Message::Ping), Message::Ping));
        assert!(matches!(roundtrip(Message::Pong), Message::Pong));
        assert!(matches!(roundtrip(Message::NotifyReq), Message::NotifyReq));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, &Message::Ping).unwrap();
        let len = buf.len();
        buf[len - 5] ^= 0xFF; // flip a bit inside the CRC field
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::Frame(FrameError::BadChecksum)));
    }

    #[test]
    fn wrong_magic_prefix_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, &Message::Ping).unwrap();
        buf[0] = b'X';
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::Frame(FrameError::NoPrefix)));
    }

    #[test]
    fn truncated_frame_is_too_short() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, &Message::Ping).unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::Frame(FrameError::TooShort)));
    }
}
