//! The Chord node state machine: join, notify, stabilize, fix-fingers.
//!
//! Generalizes the teacher's `request_handler.rs`
//! (`find_successor_of_node_request_handler`, `node_notification_request_handler`,
//! `get_successor_list_request_handler`, `get_predecessor_request_handler`,
//! `check_node_request_handler`) and `main.rs`'s join flow /
//! `run_network_stabilization` into typed operations over a full `B`-entry
//! finger table, rather than the teacher's fixed five-entry successor list.
//!
//! The routing table, peer registry, and predecessor are mutated under one
//! [`RwLock`] (`Shared`) rather than the teacher's independently-locked
//! `Arc<RwLock<Option<Node>>>` / `Arc<RwLock<[Node; N]>>` pair, closing the
//! check-then-act window a split lock leaves open between reading the
//! successor and deciding whether to replace it.

pub mod config;
pub mod server;

use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};

use rand::Rng;

pub use config::Config;
pub use server::Task;

use crate::errors::JoinError;
use crate::identifier::{modulo, HashSource, Identifier, Interval};
use crate::peer::{ChordNode, PeerId, PeerRegistry, RemoteNode, SELF_PEER_ID};
use crate::protocol::correlator;
use crate::protocol::Message;
use crate::routing::{Lookup, RoutingTable};

struct Shared {
    fingers: RoutingTable,
    peers: PeerRegistry,
    predecessor: Option<PeerId>,
}

/// A running Chord node: identifier, listener address, and the mutable
/// state (routing table, peer registry, predecessor) shared across the
/// accept loop, per-connection reader threads, and the stabilize/fix-fingers
/// tickers.
pub struct LocalNode {
    identifier: Identifier,
    listener_addr: SocketAddr,
    hash_source: Arc<dyn HashSource>,
    config: Config,
    tasks: Sender<Task>,
    shared: RwLock<Shared>,
}

impl LocalNode {
    /// Builds a fresh node rooted at `hash_source.hash_of(listener_addr)`,
    /// with an empty routing table and no peers — the state a node has
    /// immediately after `Init`, before any `join()`. `tasks` is the worker
    /// pool's queue, shared with the accept loop, used to dispatch frames
    /// read off connections this node opens itself (e.g. during `join()`
    /// or `stabilize()`).
    pub fn new(listener_addr: SocketAddr, hash_source: Arc<dyn HashSource>, config: Config, tasks: Sender<Task>) -> Self {
        let identifier = hash_source.hash_of(&addr_hash_bytes(listener_addr));
        let fingers = RoutingTable::new(identifier, SELF_PEER_ID, config.bitcount, config.route_fallback);

        Self {
            identifier,
            listener_addr,
            hash_source,
            config,
            tasks,
            shared: RwLock::new(Shared {
                fingers,
                peers: PeerRegistry::new(),
                predecessor: None,
            }),
        }
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of distinct non-self peers currently referenced by the
    /// routing table. A freshly-initialized single-node ring has 0; after
    /// `join()` resolves onto another node, at least 1.
    pub fn real_length(&self) -> usize {
        self.shared.read().unwrap().fingers.real_length()
    }

    pub fn successor_addr(&self) -> SocketAddr {
        let shared = self.shared.read().unwrap();
        self.resolve_addr(&shared, shared.fingers.successor())
    }

    pub fn predecessor_addr(&self) -> Option<SocketAddr> {
        let shared = self.shared.read().unwrap();
        shared.predecessor.map(|p| self.resolve_addr(&shared, Some(p)))
    }

    /// Listener addresses of every peer this node has ever inserted into
    /// its routing table (spec.md §3's `seen_nodes`), excluding itself.
    /// Membership here only shrinks when a peer is explicitly removed
    /// ([`LocalNode::remove_node`]) — it is not pruned merely for falling
    /// out of every finger, so it reflects history, not current routing
    /// state.
    pub fn seen_peer_addrs(&self) -> Vec<SocketAddr> {
        let shared = self.shared.read().unwrap();
        shared
            .fingers
            .seen_nodes()
            .filter(|p| **p != SELF_PEER_ID)
            .filter_map(|p| shared.peers.get(*p).map(|r| r.listener_addr()))
            .collect()
    }

    fn resolve_addr(&self, shared: &Shared, peer: Option<PeerId>) -> SocketAddr {
        match peer {
            Some(p) if p != SELF_PEER_ID => shared
                .peers
                .get(p)
                .map(|r| r.listener_addr())
                .unwrap_or(self.listener_addr),
            _ => self.listener_addr,
        }
    }

    fn hash_of_addr(&self, addr: SocketAddr) -> Identifier {
        self.hash_source.hash_of(&addr_hash_bytes(addr))
    }

    fn peer_hash(&self, peers: &PeerRegistry, peer: PeerId) -> Identifier {
        if peer == SELF_PEER_ID {
            self.identifier
        } else {
            peers.identifier_of(peer)
        }
    }

    /// Registers an accepted inbound connection as a peer with a
    /// provisional listener address (its true listener address arrives with
    /// the first `JOIN_REQ`/other message). The caller is expected to have
    /// already cloned its own reader handle from the same stream before
    /// handing it here.
    pub(crate) fn register_inbound(&self, stream: TcpStream) -> io::Result<PeerId> {
        let provisional_addr = stream.peer_addr()?;
        let node = RemoteNode::new(stream, provisional_addr)?;
        Ok(self.shared.write().unwrap().peers.insert(node))
    }

    fn connect_peer(self: &Arc<Self>, addr: SocketAddr) -> io::Result<PeerId> {
        let stream = TcpStream::connect(addr)?;
        let node = RemoteNode::new(stream, addr)?;
        let reader = node.reader_handle()?;
        let peer_id = self.shared.write().unwrap().peers.insert(node);
        server::spawn_reader(Arc::clone(self), peer_id, reader, self.tasks.clone());
        Ok(peer_id)
    }

    fn connect_or_reuse_peer(self: &Arc<Self>, addr: SocketAddr, hash: Identifier) -> io::Result<PeerId> {
        let existing = {
            let shared = self.shared.read().unwrap();
            shared.peers.iter().find(|(_, r)| r.listener_addr() == addr).map(|(id, _)| id)
        };

        let peer_id = match existing {
            Some(id) => id,
            None => {
                let id = self.connect_peer(addr)?;
                // A connection we just dialed is unknown to the other
                // side beyond our ephemeral source port. `NOTIFY_REQ` is
                // payload-less (spec.md §6), so its handler resolves the
                // notifier purely from the peer already registered against
                // this connection (§4.5 "let p be the peer owning conn") —
                // announce ourselves with a `JOIN_REQ` round trip first so
                // that registration exists before `notify()` is called on
                // this peer.
                if let Err(err) = self.announce_to(id) {
                    log::warn!("stabilize: could not announce ourselves to {}: {}", addr, err);
                }
                id
            }
        };

        if let Some(remote) = self.shared.write().unwrap().peers.get_mut(peer_id) {
            remote.set_identifier(hash);
        }

        Ok(peer_id)
    }

    /// Registers our own identity with a freshly-dialed peer via a
    /// `JOIN_REQ`/`JOIN_RESP` round trip, discarding the response — the
    /// side effect (the peer learning our hash and listener address) is
    /// all that's needed here, not the successor it names. See
    /// [`LocalNode::connect_or_reuse_peer`].
    fn announce_to(self: &Arc<Self>, peer_id: PeerId) -> Result<(), crate::errors::RequestError> {
        let (writer, correlator, addr) = {
            let shared = self.shared.read().unwrap();
            match shared.peers.get(peer_id) {
                Some(r) => (r.writer_handle(), r.correlator(), r.listener_addr()),
                None => return Ok(()),
            }
        };

        let message = Message::JoinReq { listener_addr: self.listener_addr };
        let mut writer = writer.lock().unwrap();
        correlator.request(&mut *writer, &message, addr, self.config.request_timeout)?;
        Ok(())
    }

    /// Adds `node` (already connected and registered under `peer_id`) to
    /// the routing table. A thin wrapper: `RoutingTable::insert` already
    /// maintains every entry's distance invariant, including the successor
    /// slot.
    fn add_node(&self, node_hash: Identifier, peer_id: PeerId) {
        let mut shared = self.shared.write().unwrap();
        let Shared { fingers, peers, .. } = &mut *shared;
        fingers.insert(node_hash, peer_id, |p| {
            if p == SELF_PEER_ID {
                self.identifier
            } else {
                peers.identifier_of(p)
            }
        });
    }

    /// Removes `peer_id` from the routing table, re-deriving the successor
    /// and/or predecessor if either pointed at it.
    fn remove_node(&self, peer_id: PeerId) {
        let mut shared = self.shared.write().unwrap();
        let Shared { fingers, peers, predecessor } = &mut *shared;
        let modulus = fingers.modulus();
        let removed_hash = if peer_id == SELF_PEER_ID {
            self.identifier
        } else {
            peers.identifier_of(peer_id)
        };

        let peer_hash_of = |p: PeerId| {
            if p == SELF_PEER_ID {
                self.identifier
            } else {
                peers.identifier_of(p)
            }
        };

        let was_successor = fingers.successor() == Some(peer_id);
        let was_predecessor = *predecessor == Some(peer_id);

        fingers.remove(peer_id, &peer_hash_of);

        if was_successor {
            let value = modulo(removed_hash.as_int().wrapping_add(1), modulus);
            // On a table with no remaining peers, `find_successor` falls
            // through to `Lookup::Local(root_peer)` (there is nothing left
            // to route to). That is not a real successor — `set_successor`
            // would otherwise write `SELF_PEER_ID` into entry 0 and into
            // `seen_nodes`, violating "seen_nodes ⊇ nodes ≠ root" (spec.md
            // §3). Leave the slot empty instead, same as the original's
            // `find_successor` returning `None` here (`localnode.py:143-144`).
            if let Lookup::Local(new_succ) = fingers.find_successor(value, &peer_hash_of) {
                if new_succ != SELF_PEER_ID {
                    fingers.set_successor(new_succ);
                }
            }
        }

        if was_predecessor {
            // `wrapping_sub` then `modulo` handles the `removed_hash == 0`
            // wrap-to-`modulus - 1` case uniformly, including the
            // full-128-bit-ring sentinel (`modulus == 0`) where `modulus - 1`
            // itself would underflow.
            let value = modulo(removed_hash.as_int().wrapping_sub(1), modulus);
            // Same fall-through as above: an emptied table's
            // `find_predecessor` resolves to root itself, which must not
            // become our own predecessor (spec.md §4.5 invariant
            // "predecessor ≠ self"; the original's `localnode.py:146-147`
            // yields `None` here too).
            *predecessor = match fingers.find_predecessor(value, &peer_hash_of) {
                Lookup::Local(new_pred) if new_pred != peer_id && new_pred != SELF_PEER_ID => Some(new_pred),
                _ => None,
            };
        }
    }

    /// Closes every connection this node currently holds (spec.md §5:
    /// shutdown closes all connections; the owning reader threads observe
    /// the close and evict their peers via [`LocalNode::on_connection_close`]
    /// as usual, so no separate eviction pass is needed here). Tickers are
    /// not stopped by this call; the caller (or process exit) is
    /// responsible for that.
    pub fn shutdown(&self) {
        let shared = self.shared.read().unwrap();
        for (_, remote) in shared.peers.iter() {
            remote.correlator().cancel_all();
            let _ = remote.connection().shutdown(std::net::Shutdown::Both);
        }
    }

    /// Called by a connection's reader thread once its stream closes:
    /// evicts the peer from both the routing table and the registry.
    pub(crate) fn on_connection_close(&self, peer_id: PeerId) {
        self.remove_node(peer_id);
        let mut shared = self.shared.write().unwrap();
        if let Some(mut node) = shared.peers.remove(peer_id) {
            node.mark_complete();
        }
    }

    /// Dispatches one incoming, already-decoded frame to the correlator;
    /// if it turns out to be an unsolicited request, replies on the same
    /// connection.
    pub(crate) fn on_frame(self: &Arc<Self>, peer_id: PeerId, corr_id: u32, message: Message) {
        let correlator = {
            let shared = self.shared.read().unwrap();
            match shared.peers.get(peer_id) {
                Some(p) => p.correlator(),
                None => return,
            }
        };

        if let Some((corr_id, message)) = correlator.dispatch_incoming(corr_id, message) {
            self.handle_request(peer_id, corr_id, message);
        }
    }

    fn handle_request(&self, peer_id: PeerId, corr_id: u32, message: Message) {
        let response = match message {
            Message::JoinReq { listener_addr } => self.on_join_req(peer_id, listener_addr),
            Message::NotifyReq => self.on_notify_req(peer_id),
            Message::InfoReq => self.on_info_req(),
            Message::Ping => Message::Pong,
            other => {
                log::warn!("peer sent a response-shaped message unsolicited: {:?}", other.message_type());
                return;
            }
        };

        let writer = {
            let shared = self.shared.read().unwrap();
            match shared.peers.get(peer_id) {
                Some(p) => p.writer_handle(),
                None => return,
            }
        };

        let mut writer = writer.lock().unwrap();
        if let Err(err) = correlator::respond(&mut *writer, corr_id, &response) {
            log::warn!("failed to send reply to peer: {}", err);
        }
    }

    fn on_join_req(&self, peer_id: PeerId, requester_listener_addr: SocketAddr) -> Message {
        let requester_hash = self.hash_of_addr(requester_listener_addr);

        {
            let mut shared = self.shared.write().unwrap();
            if let Some(remote) = shared.peers.get_mut(peer_id) {
                remote.set_identifier(requester_hash);
                remote.set_listener_addr(requester_listener_addr);
            }
        }

        self.add_node(requester_hash, peer_id);

        {
            let mut shared = self.shared.write().unwrap();
            let modulus = shared.fingers.modulus();
            let Shared { peers, predecessor, .. } = &mut *shared;

            let update = match *predecessor {
                None => true,
                Some(pred) => {
                    let pred_hash = self.peer_hash(peers, pred);
                    Interval::new(
                        modulo(pred_hash.as_int(), modulus),
                        modulo(self.identifier.as_int(), modulus),
                        modulus,
                    )
                    .within(modulo(requester_hash.as_int(), modulus))
                }
            };
            if update {
                *predecessor = Some(peer_id);
            }
        }

        let shared = self.shared.read().unwrap();
        let successor_addr = self.resolve_addr(&shared, shared.fingers.successor());
        let (resp_hash, resp_addr) = if shared.fingers.successor().is_none() || successor_addr == requester_listener_addr {
            (self.identifier, self.listener_addr)
        } else {
            let succ = shared.fingers.successor().unwrap();
            (self.peer_hash(&shared.peers, succ), successor_addr)
        };

        Message::JoinResp {
            node_hash: resp_hash,
            listener_addr: resp_addr,
        }
    }

    fn on_notify_req(&self, peer_id: PeerId) -> Message {
        let mut shared = self.shared.write().unwrap();
        let modulus = shared.fingers.modulus();
        let Shared { fingers, peers, predecessor } = &mut *shared;

        // No payload to derive the notifier from (spec.md §6: `NOTIFY_REQ`
        // is empty) — `peer_id` already names the connection it arrived
        // on, and that peer's identity/listener address were established
        // when the connection was registered (`on_join_req`, or
        // `announce_to` for connections this node itself dialed).
        let p_hash = self.peer_hash(peers, peer_id);
        // spec.md §4.5: "Assert p != self" — a peer notifying us of itself
        // as our own predecessor is a programmer error (identifier
        // collision or a loopback connection to ourselves), not a protocol
        // error; debug_assert so a deployment still serves the request in
        // release builds rather than crashing the node over it.
        debug_assert_ne!(p_hash, self.identifier, "peer notified us using our own identifier");

        let update = match *predecessor {
            None => true,
            Some(pred) => {
                let pred_hash = self.peer_hash(peers, pred);
                Interval::new(
                    modulo(pred_hash.as_int(), modulus),
                    modulo(self.identifier.as_int(), modulus),
                    modulus,
                )
                .within_open(modulo(p_hash.as_int(), modulus))
            }
        };
        if update {
            *predecessor = Some(peer_id);
        }

        let successor_addr = match fingers.successor() {
            Some(s) if s != SELF_PEER_ID => peers.get(s).map(|r| r.listener_addr()).unwrap_or(self.listener_addr),
            _ => self.listener_addr,
        };
        let predecessor_addr = match *predecessor {
            Some(pr) if pr != SELF_PEER_ID => peers.get(pr).map(|r| r.listener_addr()).unwrap_or(self.listener_addr),
            _ => self.listener_addr,
        };

        Message::NotifyResp {
            node_hash: self.identifier,
            successor_listener_addr: successor_addr,
            predecessor_listener_addr: predecessor_addr,
        }
    }

    fn on_info_req(&self) -> Message {
        let shared = self.shared.read().unwrap();
        let successor_addr = self.resolve_addr(&shared, shared.fingers.successor());
        let predecessor_addr = self.resolve_addr(&shared, shared.predecessor);

        Message::InfoResp {
            node_hash: self.identifier,
            successor_listener_addr: successor_addr,
            predecessor_listener_addr: predecessor_addr,
        }
    }

    /// Joins an existing ring through `entry_addr`. Preconditions: the
    /// routing table references at most the root itself, and there is no
    /// predecessor yet.
    pub fn join(self: &Arc<Self>, entry_addr: SocketAddr) -> Result<(), JoinError> {
        {
            let shared = self.shared.read().unwrap();
            if shared.fingers.real_length() > 0 || shared.predecessor.is_some() {
                return Err(JoinError::PreconditionViolated);
            }
        }

        let entry_peer = self.connect_peer(entry_addr)?;

        let (writer, correlator) = {
            let shared = self.shared.read().unwrap();
            let remote = shared.peers.get(entry_peer).expect("just registered");
            (remote.writer_handle(), remote.correlator())
        };

        let response = {
            let mut writer = writer.lock().unwrap();
            correlator.request(
                &mut *writer,
                &Message::JoinReq { listener_addr: self.listener_addr },
                entry_addr,
                self.config.join_timeout,
            )?
        };

        let (succ_hash, succ_listener_addr) = match response {
            Message::JoinResp { node_hash, listener_addr } => (node_hash, listener_addr),
            _ => return Err(JoinError::Request(crate::errors::RequestError::UnexpectedResponse)),
        };

        if succ_listener_addr == entry_addr {
            let mut shared = self.shared.write().unwrap();
            if let Some(remote) = shared.peers.get_mut(entry_peer) {
                remote.set_identifier(succ_hash);
            }
            shared.fingers.set_successor(entry_peer);
        } else {
            let succ_peer = self.connect_peer(succ_listener_addr)?;
            if let Some(remote) = self.shared.write().unwrap().peers.get_mut(succ_peer) {
                remote.set_identifier(succ_hash);
            }
            self.add_node(succ_hash, succ_peer);
        }

        Ok(())
    }

    fn notify(self: &Arc<Self>, peer_id: PeerId) {
        let (writer, correlator, addr) = {
            let shared = self.shared.read().unwrap();
            match shared.peers.get(peer_id) {
                Some(r) => (r.writer_handle(), r.correlator(), r.listener_addr()),
                None => return,
            }
        };

        let mut writer = writer.lock().unwrap();
        if let Err(err) = correlator.request(&mut *writer, &Message::NotifyReq, addr, self.config.request_timeout) {
            log::warn!("notify: round trip to {} failed: {}", addr, err);
        }
    }

    /// Periodic stabilization: confirms the successor still considers us
    /// (or a closer node) its predecessor, and notifies whoever the
    /// successor turns out to be.
    pub fn stabilize(self: &Arc<Self>) {
        let (succ_peer, succ_hash, succ_listener_addr, writer, correlator) = {
            let shared = self.shared.read().unwrap();
            let succ = match shared.fingers.successor() {
                Some(s) if s != SELF_PEER_ID => s,
                _ => return,
            };
            let remote = match shared.peers.get(succ) {
                Some(r) => r,
                None => return,
            };
            (succ, remote.node_hash(), remote.listener_addr(), remote.writer_handle(), remote.correlator())
        };

        let response = {
            let mut writer = writer.lock().unwrap();
            correlator.request(&mut *writer, &Message::InfoReq, succ_listener_addr, self.config.request_timeout)
        };

        let x_addr = match response {
            Ok(Message::InfoResp { predecessor_listener_addr, .. }) => predecessor_listener_addr,
            Ok(_) => return,
            Err(err) => {
                log::warn!("stabilize: INFO round trip to successor failed: {}", err);
                return;
            }
        };

        // The successor reporting itself as its own predecessor is this
        // design's null convention (spec.md's wire payloads have no
        // explicit absent-address encoding).
        if x_addr == succ_listener_addr {
            self.notify(succ_peer);
            return;
        }

        let modulus = self.shared.read().unwrap().fingers.modulus();
        let x_hash = self.hash_of_addr(x_addr);
        let x_is_closer = Interval::new(
            modulo(self.identifier.as_int(), modulus),
            modulo(succ_hash.as_int(), modulus),
            modulus,
        )
        .within_open(modulo(x_hash.as_int(), modulus));

        let new_successor = if x_is_closer {
            match self.connect_or_reuse_peer(x_addr, x_hash) {
                Ok(peer) => {
                    self.shared.write().unwrap().fingers.set_successor(peer);
                    peer
                }
                Err(err) => {
                    log::warn!("stabilize: could not connect to candidate successor {}: {}", x_addr, err);
                    succ_peer
                }
            }
        } else {
            succ_peer
        };

        self.notify(new_successor);
    }

    /// Refreshes one randomly-chosen finger, continuing the lookup as far
    /// as local routing information allows. A lookup that would need to
    /// continue on a remote peer's own finger table (no `FIND_SUCCESSOR`
    /// wire message exists for that) is left for the next tick, the same
    /// "may leave empty" policy `RoutingTable::remove` already applies to
    /// vacated entries.
    pub fn fix_fingers(&self) {
        let mut shared = self.shared.write().unwrap();
        let bitcount = shared.fingers.len();
        if bitcount < 2 {
            return;
        }
        let i = rand::rng().random_range(1..bitcount);

        if shared.fingers.finger(i).is_empty() {
            return;
        }

        let Shared { fingers, peers, .. } = &mut *shared;
        let peer_hash_of = |p: PeerId| {
            if p == SELF_PEER_ID {
                self.identifier
            } else {
                peers.identifier_of(p)
            }
        };
        let start = fingers.finger(i).interval().start();
        if let Lookup::Local(succ) = fingers.find_successor(start, &peer_hash_of) {
            fingers.set_finger(i, succ);
        }
    }
}

impl ChordNode for LocalNode {
    fn node_hash(&self) -> Identifier {
        self.identifier
    }

    fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }
}

/// Derives the bytes hashed to obtain a node's identifier from its
/// listener address: IP octets followed by the big-endian port, exactly
/// the teacher's `Node::generate_identifier`.
fn addr_hash_bytes(addr: SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
    }
    bytes.extend_from_slice(&addr.port().to_be_bytes());
    bytes
}
