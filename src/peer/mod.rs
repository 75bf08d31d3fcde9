//! Peer registry and remote-node handles.
//!
//! Generalizes the teacher's flat `Vec<RemoteNode>`/`self.peers` list
//! (`LocalNode.peers` in the original `localnode.py`, `self_node_successor_list`
//! in the teacher's `main.rs`) into an id-addressed registry. [`PeerId`] is
//! the stable handle the design notes call for: it breaks the
//! root→table→node→root ownership cycle, since [`crate::routing::Route`]
//! entries and `seen_nodes` hold `PeerId`s rather than owning `RemoteNode`
//! values directly. The registry is the sole owner.

use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::identifier::Identifier;
use crate::protocol::correlator::Correlator;

/// A stable handle to a peer, valid for the lifetime of the owning
/// [`PeerRegistry`] entry. Cheap to copy, used everywhere a `RemoteNode`
/// would otherwise need to be referenced by value.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

/// Sentinel id representing the local node itself wherever a `PeerId` is
/// required (the routing table's `root_peer`, the local route's candidate).
/// Reserved: [`next_peer_id`] starts counting from 1, so this can never
/// collide with a registry-issued id.
pub const SELF_PEER_ID: PeerId = PeerId::from_raw(0);

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

fn next_peer_id() -> PeerId {
    PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
}

/// The capability set shared by local and remote Chord nodes (design note:
/// replaces the teacher's implicit duck-typed dispatch between `LocalNode`
/// and `RemoteNode` with an explicit trait).
pub trait ChordNode {
    fn node_hash(&self) -> Identifier;
    fn listener_addr(&self) -> std::net::SocketAddr;
}

/// A remote Chord node: an owned connection plus the cached identity of
/// the peer at the other end.
///
/// The identifier may be provisionally unknown immediately after an
/// outbound connect and before the first protocol exchange establishes it
/// (mirrors the original's `Hash(value="notset")` placeholder).
pub struct RemoteNode {
    identifier: Option<Identifier>,
    listener_addr: std::net::SocketAddr,
    connection: TcpStream,
    writer: Arc<std::sync::Mutex<TcpStream>>,
    correlator: Arc<Correlator>,
    complete: bool,
}

impl RemoteNode {
    /// Wraps `connection`, cloning its handle for the writer so that a
    /// dedicated reader thread can own `connection` directly (the read
    /// side of a `TcpStream` needs no synchronization of its own) while
    /// [`RemoteNode::writer_handle`] is cheaply shareable with callers
    /// issuing correlated requests concurrently.
    pub fn new(connection: TcpStream, listener_addr: std::net::SocketAddr) -> io::Result<Self> {
        let writer = connection.try_clone()?;
        Ok(Self {
            identifier: None,
            listener_addr,
            connection,
            writer: Arc::new(std::sync::Mutex::new(writer)),
            correlator: Arc::new(Correlator::new()),
            complete: false,
        })
    }

    pub fn identifier(&self) -> Option<Identifier> {
        self.identifier
    }

    pub fn set_identifier(&mut self, identifier: Identifier) {
        self.identifier = Some(identifier);
    }

    pub fn listener_addr(&self) -> std::net::SocketAddr {
        self.listener_addr
    }

    /// Overwrites the listener address, used once an inbound connection's
    /// real listener address arrives in its first `JOIN_REQ` (inbound
    /// connections are registered with the ephemeral peer address as a
    /// placeholder, since a dialer's source port is not its listener port).
    pub fn set_listener_addr(&mut self, addr: std::net::SocketAddr) {
        self.listener_addr = addr;
    }

    pub fn connection(&self) -> &TcpStream {
        &self.connection
    }

    /// A cheaply-cloned, mutex-guarded handle to this connection's write
    /// half, shareable with a caller blocked in a correlated request
    /// without holding the registry's lock for the duration of the call.
    pub fn writer_handle(&self) -> Arc<std::sync::Mutex<TcpStream>> {
        Arc::clone(&self.writer)
    }

    /// Clones a fresh handle to the read half, for a dedicated reader
    /// thread to own independently of the registry.
    pub fn reader_handle(&self) -> io::Result<TcpStream> {
        self.connection.try_clone()
    }

    pub fn correlator(&self) -> Arc<Correlator> {
        Arc::clone(&self.correlator)
    }

    /// Whether this peer's connection has closed (or it was judged dead).
    /// Transitions false → true exactly once.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Marks the connection closed. Idempotent.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }
}

impl ChordNode for RemoteNode {
    /// Falls back to `Identifier::from_int(0)` when the identifier is not
    /// yet known (immediately after an outbound connect, before the first
    /// protocol exchange establishes it).
    fn node_hash(&self) -> Identifier {
        self.identifier.unwrap_or_else(|| Identifier::from_int(0))
    }

    fn listener_addr(&self) -> std::net::SocketAddr {
        self.listener_addr
    }
}

/// An ordered collection of [`RemoteNode`]s, keyed by [`PeerId`]. Supports
/// insertion, id-based lookup, and (infrequent) removal.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, RemoteNode>,
    order: Vec<PeerId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node`, returning its freshly allocated id.
    pub fn insert(&mut self, node: RemoteNode) -> PeerId {
        let id = next_peer_id();
        self.peers.insert(id, node);
        self.order.push(id);
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&RemoteNode> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut RemoteNode> {
        self.peers.get_mut(&id)
    }

    /// Removes and returns the peer registered under `id`, if any.
    pub fn remove(&mut self, id: PeerId) -> Option<RemoteNode> {
        self.order.retain(|existing| *existing != id);
        self.peers.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &RemoteNode)> {
        self.order
            .iter()
            .filter_map(move |id| self.peers.get(id).map(|node| (*id, node)))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns the identifier of a registered peer, falling back to
    /// `Identifier::from_int(0)` for a provisionally-unknown peer. Used as
    /// the `peer_hash_of` closure the routing table needs to compare
    /// distances without owning the peers itself.
    pub fn identifier_of(&self, id: PeerId) -> Identifier {
        self.get(id)
            .and_then(|p| p.identifier())
            .unwrap_or_else(|| Identifier::from_int(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn registry_insert_get_remove_roundtrip() {
        let (client, _server) = loopback_pair();
        let mut registry = PeerRegistry::new();
        let node = RemoteNode::new(client, "127.0.0.1:1".parse().unwrap()).unwrap();
        let id = registry.insert(node);

        assert!(registry.get(id).is_some());
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(id);
        assert!(removed.is_some());
        assert!(registry.get(id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn peer_ids_are_unique() {
        let (c1, _s1) = loopback_pair();
        let (c2, _s2) = loopback_pair();
        let mut registry = PeerRegistry::new();
        let id1 = registry.insert(RemoteNode::new(c1, "127.0.0.1:1".parse().unwrap()).unwrap());
        let id2 = registry.insert(RemoteNode::new(c2, "127.0.0.1:2".parse().unwrap()).unwrap());
        assert_ne!(id1, id2);
    }

    #[test]
    fn remote_node_complete_transitions_once() {
        let (client, _server) = loopback_pair();
        let mut node = RemoteNode::new(client, "127.0.0.1:1".parse().unwrap()).unwrap();
        assert!(!node.is_complete());
        node.mark_complete();
        assert!(node.is_complete());
        node.mark_complete();
        assert!(node.is_complete());
    }
}
