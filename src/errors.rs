//! Error kinds for the Chord core (spec.md §7).
//!
//! Replaces the teacher's `Box<dyn Error>` + ad-hoc `String` messages
//! (`chord::mod::initialize_self_node_core_components`,
//! `cli::Args::parse`) with `thiserror`-derived enums so frame, protocol,
//! request and join failures are distinguishable at the type level, which
//! the peer-eviction logic (§7: frame/protocol errors close the connection
//! and trigger `remove_node`) depends on.

use std::net::SocketAddr;

/// Malformed-envelope errors. None of these are fatal to the process: the
/// owning connection is closed and its peer is evicted from the routing
/// table.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("frame too short to contain a header")]
    TooShort,
    #[error("missing or corrupt magic prefix")]
    NoPrefix,
    #[error("missing or corrupt magic suffix")]
    NoSuffix,
    #[error("unsupported protocol version {found}, expected {expected}")]
    WrongVersion { found: u16, expected: u16 },
    #[error("payload length {declared} does not match {actual} bytes read")]
    WrongLength { declared: u32, actual: u32 },
    #[error("CRC32 checksum mismatch")]
    BadChecksum,
    #[error("payload does not decode to a valid {HASHLEN}-byte identifier", HASHLEN = crate::identifier::HASHLEN)]
    BadHash,
    #[error("I/O error while reading/writing a frame: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in interpreting an otherwise well-framed message.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("malformed payload for message type {0:?}")]
    MalformedPayload(crate::protocol::MessageType),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A correlated request failed to complete.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("request to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },
    #[error("too many outstanding requests on this connection")]
    TooManyOutstanding,
    #[error("request cancelled by node shutdown")]
    Cancelled,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unexpected response variant for this request")]
    UnexpectedResponse,
}

/// `join()` preconditions or network failure.
#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("join preconditions violated: routing table already has peers or a predecessor is set")]
    PreconditionViolated,
    #[error("join request to {0} timed out")]
    Timeout(SocketAddr),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("could not resolve entry address: {0}")]
    Io(#[from] std::io::Error),
}
