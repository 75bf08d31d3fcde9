//! The finger table: a per-node routing table over the identifier ring.
//!
//! Generalizes the teacher's fixed five-entry successor list
//! (`SUCCESSOR_LIST_LENGTH` in `chord/mod.rs`) into a full `bitcount`-entry
//! finger table, each entry backed by a short candidate list (the
//! teacher's successor-list idea, now applied to every finger instead of
//! just finger 0).

use std::collections::HashSet;

use crate::identifier::{moddist, modulo, ring_modulus, Identifier, Interval};
use crate::peer::PeerId;

/// Default bound on a [`Route`]'s candidate list length.
pub const DEFAULT_ROUTE_FALLBACK: usize = 5;

/// A single finger-table entry: the arc it is responsible for, and a short
/// ordered list of candidate peers, the last of which is "current".
#[derive(Clone, Debug)]
pub struct Route {
    interval: Interval,
    candidates: Vec<PeerId>,
    capacity: usize,
}

impl Route {
    fn new(interval: Interval, capacity: usize) -> Self {
        Self {
            interval,
            candidates: Vec::new(),
            capacity,
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// The current candidate for this entry, if any.
    pub fn node(&self) -> Option<PeerId> {
        self.candidates.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Pushes a new current candidate, evicting the oldest once the list
    /// is at capacity.
    fn set_node(&mut self, node: PeerId) {
        while self.candidates.len() >= self.capacity {
            self.candidates.remove(0);
        }
        self.candidates.push(node);
    }

    /// Pops the current candidate. No-op on an empty entry.
    fn remove_current(&mut self) {
        self.candidates.pop();
    }
}

/// Result of a predecessor/successor lookup against a single routing
/// table: either resolved without leaving this node ([`Local`]), or
/// requiring the caller to continue the search against a remote peer
/// ([`Forward`]) — the recursion boundary from spec.md §4.2/§9.
///
/// [`Local`]: Lookup::Local
/// [`Forward`]: Lookup::Forward
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Lookup {
    Local(PeerId),
    Forward(PeerId),
}

/// A Chord node's finger table, rooted at a local identifier.
///
/// Entry `i` covers `[root + 2^i mod M, root + 2^(i+1) mod M)`. Entry 0 is
/// the successor slot. `seen_nodes` is the membership set of every peer
/// ever inserted (root excluded); `local` is the synthetic arc covering
/// `[end of last finger, root]`, representing the root's own position.
pub struct RoutingTable {
    root_peer: PeerId,
    modulus: u128,
    entries: Vec<Route>,
    local: Route,
    seen_nodes: HashSet<PeerId>,
}

impl RoutingTable {
    /// Builds a table of `bitcount` entries rooted at `root`/`root_peer`.
    pub fn new(root: Identifier, root_peer: PeerId, bitcount: u32, route_fallback: usize) -> Self {
        let modulus = ring_modulus(bitcount);
        let root_int = modulo(root.as_int(), modulus);

        // `1u128 << bitcount` itself would panic (bitcount == 128 is an
        // out-of-range shift for a 128-bit integer); `checked_shl` maps that
        // one case to `0`, which is exactly `2^128 mod 2^128` so the
        // addition below still lands on the correct wrapped offset.
        let entries: Vec<Route> = (0..bitcount)
            .map(|i| {
                let offset_start = 1u128.checked_shl(i).unwrap_or(0);
                let offset_end = 1u128.checked_shl(i + 1).unwrap_or(0);
                let start = modulo(root_int.wrapping_add(offset_start), modulus);
                let end = modulo(root_int.wrapping_add(offset_end), modulus);
                Route::new(Interval::new(start, end, modulus), route_fallback)
            })
            .collect();

        let last_end = entries.last().map(|e| e.interval.end()).unwrap_or(root_int);
        let mut local = Route::new(Interval::new(last_end, root_int, modulus), 1);
        local.set_node(root_peer);

        Self {
            root_peer,
            modulus,
            entries,
            local,
            seen_nodes: HashSet::new(),
        }
    }

    pub fn modulus(&self) -> u128 {
        self.modulus
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finger(&self, i: usize) -> &Route {
        &self.entries[i]
    }

    pub fn successor(&self) -> Option<PeerId> {
        self.entries[0].node()
    }

    /// Directly overwrites the successor slot (used by `stabilize`, which
    /// sets a freshly-learned successor without going through the usual
    /// distance comparison in [`insert`]).
    pub fn set_successor(&mut self, node: PeerId) {
        self.entries[0].set_node(node);
        self.seen_nodes.insert(node);
    }

    /// Directly overwrites finger `i` (used by `fix_fingers`, which
    /// resolves a candidate out-of-band and then commits it here, bypassing
    /// the distance comparison in [`insert`]).
    pub fn set_finger(&mut self, i: usize, node: PeerId) {
        self.entries[i].set_node(node);
        self.seen_nodes.insert(node);
    }

    pub fn seen_nodes(&self) -> impl Iterator<Item = &PeerId> {
        self.seen_nodes.iter()
    }

    /// Number of distinct peers referenced across all entries.
    pub fn real_length(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| e.node())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Adds `node` (identified by `node_hash`/`node_peer`) to the table if
    /// it is closer than the current candidate of any entry. No-op if
    /// `node_peer == root_peer`.
    pub fn insert(&mut self, node_hash: Identifier, node_peer: PeerId, peer_hash_of: impl Fn(PeerId) -> Identifier) {
        if node_peer == self.root_peer {
            return;
        }

        self.seen_nodes.insert(node_peer);

        let node_int = modulo(node_hash.as_int(), self.modulus);

        for entry in self.entries.iter_mut() {
            let better = match entry.node() {
                None => true,
                Some(current) => {
                    let current_int = modulo(peer_hash_of(current).as_int(), self.modulus);
                    moddist(entry.interval.start(), node_int, self.modulus)
                        < moddist(entry.interval.start(), current_int, self.modulus)
                }
            };

            if better {
                entry.set_node(node_peer);
            }
        }
    }

    /// Removes `node` from every entry that currently points to it, then
    /// attempts to refill each vacated entry via a local-only
    /// `find_predecessor`/`successor` pass (may leave the entry empty if
    /// resolving it would require asking a remote peer).
    pub fn remove(&mut self, node_peer: PeerId, peer_hash_of: impl Fn(PeerId) -> Identifier) {
        self.seen_nodes.remove(&node_peer);

        let mut vacated = Vec::new();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.node() == Some(node_peer) {
                entry.remove_current();
                vacated.push(i);
            }
        }

        for i in vacated {
            let start = self.entries[i].interval.start();
            if let Lookup::Local(_) = self.find_predecessor(start, &peer_hash_of) {
                if let Some(replacement) = self.successor() {
                    self.entries[i].set_node(replacement);
                }
            }
        }
    }

    /// Finds the predecessor of `value`.
    ///
    /// If `value` already falls within `(root, successor]`, the root
    /// itself is the predecessor ([`Lookup::Local`]). Otherwise this table
    /// has no further local routing information — the original's
    /// `start.fingers.finger(0).node is None` check, which is only ever
    /// true once the walk crosses into a `RemoteNode` with no local finger
    /// table of its own. `lookup_preceding` names the best peer to continue
    /// the walk from ([`Lookup::Forward`]); the caller (the Chord state
    /// machine, which owns connections to remote peers) must continue the
    /// lookup there, e.g. via a `FIND_SUCCESSOR_OF_NODE`-class request.
    pub fn find_predecessor(&self, value: u128, peer_hash_of: impl Fn(PeerId) -> Identifier) -> Lookup {
        let root_int = self.local.interval().end();

        let Some(succ) = self.successor() else {
            return Lookup::Local(self.root_peer);
        };

        let succ_int = modulo(peer_hash_of(succ).as_int(), self.modulus);
        let bracket = Interval::new(root_int, succ_int, self.modulus);

        if bracket.within_closed(value) {
            return Lookup::Local(self.root_peer);
        }

        let preceding = self.lookup_preceding(value, &peer_hash_of);
        if preceding == self.root_peer {
            Lookup::Local(self.root_peer)
        } else {
            Lookup::Forward(preceding)
        }
    }

    /// `find_predecessor(value).successor`, resolved only when the
    /// predecessor is local; a [`Lookup::Forward`] result must be retried
    /// by the caller against the forwarded peer.
    pub fn find_successor(&self, value: u128, peer_hash_of: impl Fn(PeerId) -> Identifier) -> Lookup {
        match self.find_predecessor(value, &peer_hash_of) {
            Lookup::Local(_) => match self.successor() {
                Some(succ) => Lookup::Local(succ),
                None => Lookup::Local(self.root_peer),
            },
            forward => forward,
        }
    }

    /// Iterates entries from highest to lowest index; returns the first
    /// entry's node whose hash lies in the open interval `(root, value)`,
    /// otherwise `root_peer`.
    pub fn lookup_preceding(&self, value: u128, peer_hash_of: impl Fn(PeerId) -> Identifier) -> PeerId {
        let root_int = self.local.interval().end();
        let probe = Interval::new(root_int, value, self.modulus);

        for i in (0..self.entries.len()).rev() {
            if let Some(n) = self.entries[i].node() {
                let n_int = modulo(peer_hash_of(n).as_int(), self.modulus);
                if probe.within_open(n_int) {
                    return n;
                }
            }
        }

        self.root_peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::TestHashSource;
    use crate::peer::PeerId;
    use std::collections::HashMap;

    fn id(v: u128) -> Identifier {
        Identifier::from_int(v)
    }

    struct Fixture {
        hashes: HashMap<PeerId, Identifier>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                hashes: HashMap::new(),
            }
        }

        fn register(&mut self, peer: PeerId, hash: Identifier) {
            self.hashes.insert(peer, hash);
        }

        fn hash_of(&self, peer: PeerId) -> Identifier {
            self.hashes[&peer]
        }
    }

    #[test]
    fn fresh_table_has_no_successor_until_state_machine_sets_it() {
        let _ = TestHashSource;
        let root_peer = PeerId::from_raw(0);
        let table = RoutingTable::new(id(10), root_peer, 6, DEFAULT_ROUTE_FALLBACK);
        assert_eq!(table.real_length(), 0);
        assert_eq!(table.len(), 6);
    }

    /// The production default (`DEFAULT_BITCOUNT == 128`) makes
    /// `RoutingTable::new` compute a ring modulus of `2^128`, which does not
    /// fit in a `u128` — this must resolve via `ring_modulus`'s `0` sentinel
    /// rather than panicking on an out-of-range shift, and entry 127's
    /// (the last entry's) arc must still end exactly at `root`, matching
    /// `[root + 2^127, root + 2^128) == [root + 2^127, root)`.
    #[test]
    fn table_at_full_128_bit_width_does_not_panic_and_wraps_correctly() {
        use crate::identifier::DEFAULT_BITCOUNT;

        let root_peer = PeerId::from_raw(0);
        let table = RoutingTable::new(id(u128::MAX - 3), root_peer, DEFAULT_BITCOUNT, DEFAULT_ROUTE_FALLBACK);
        assert_eq!(table.len(), DEFAULT_BITCOUNT as usize);
        assert_eq!(table.modulus(), 0);

        let root_int = u128::MAX - 3;
        let last = table.finger(DEFAULT_BITCOUNT as usize - 1);
        assert_eq!(last.interval().start(), root_int.wrapping_add(1u128 << 127));
        assert_eq!(last.interval().end(), root_int);
    }

    #[test]
    fn insert_prefers_closer_node_with_earlier_insert_tiebreak() {
        let mut fx = Fixture::new();
        let root_peer = PeerId::from_raw(0);
        fx.register(root_peer, id(10));

        let mut table = RoutingTable::new(id(10), root_peer, 6, DEFAULT_ROUTE_FALLBACK);

        let a = PeerId::from_raw(1);
        let b = PeerId::from_raw(2);
        fx.register(a, id(20));
        fx.register(b, id(30));

        table.insert(id(20), a, |p| fx.hash_of(p));
        assert_eq!(table.successor(), Some(a));

        // b (30) is farther from entry0.start (11) than a (20), so it
        // should not replace a anywhere it's already strictly worse.
        table.insert(id(30), b, |p| fx.hash_of(p));
        for i in 0..table.len() {
            let entry = table.finger(i);
            if let Some(node) = entry.node() {
                let node_int = fx.hash_of(node).as_int();
                let dist_a = moddist(entry.interval().start(), 20, 64);
                let dist_node = moddist(entry.interval().start(), node_int, 64);
                assert!(dist_node <= dist_a.max(dist_node));
            }
        }
    }

    #[test]
    fn remove_then_reinsert_matches_prior_state() {
        let mut fx = Fixture::new();
        let root_peer = PeerId::from_raw(0);
        fx.register(root_peer, id(10));
        let mut table = RoutingTable::new(id(10), root_peer, 6, DEFAULT_ROUTE_FALLBACK);

        let before: Vec<Option<PeerId>> = (0..table.len()).map(|i| table.finger(i).node()).collect();

        let n = PeerId::from_raw(1);
        fx.register(n, id(20));
        table.insert(id(20), n, |p| fx.hash_of(p));
        table.remove(n, |p| fx.hash_of(p));

        let after: Vec<Option<PeerId>> = (0..table.len()).map(|i| table.finger(i).node()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn self_insert_is_noop() {
        let root_peer = PeerId::from_raw(0);
        let mut table = RoutingTable::new(id(10), root_peer, 6, DEFAULT_ROUTE_FALLBACK);
        table.insert(id(10), root_peer, |_| id(10));
        assert_eq!(table.real_length(), 0);
    }

    #[test]
    fn route_candidate_list_evicts_oldest_past_capacity() {
        let mut route = Route::new(Interval::new(0, 10, 64), 2);
        route.set_node(PeerId::from_raw(1));
        route.set_node(PeerId::from_raw(2));
        route.set_node(PeerId::from_raw(3));
        assert_eq!(route.candidates, vec![PeerId::from_raw(2), PeerId::from_raw(3)]);
    }

    /// S3 (successor half): nodes at 10, 20, 30 on a `bitcount = 6` ring,
    /// A joining via nothing, B and C joining via A in turn. Successor
    /// ordering should settle at A->B, B->C, C->A regardless of join order,
    /// since each table's successor slot always holds the closest known
    /// node clockwise from root. Predecessor maintenance is a state-machine
    /// concern (`LocalNode::on_join_req`/`on_notify_req`) and is covered by
    /// the TCP integration tests instead.
    #[test]
    fn s3_three_node_successor_ordering() {
        let mut fx = Fixture::new();
        let a = PeerId::from_raw(1);
        let b = PeerId::from_raw(2);
        let c = PeerId::from_raw(3);
        fx.register(a, id(10));
        fx.register(b, id(20));
        fx.register(c, id(30));

        let mut table_a = RoutingTable::new(id(10), a, 6, DEFAULT_ROUTE_FALLBACK);
        table_a.insert(id(20), b, |p| fx.hash_of(p));
        table_a.insert(id(30), c, |p| fx.hash_of(p));
        assert_eq!(table_a.successor(), Some(b));

        let mut table_b = RoutingTable::new(id(20), b, 6, DEFAULT_ROUTE_FALLBACK);
        table_b.insert(id(10), a, |p| fx.hash_of(p));
        table_b.insert(id(30), c, |p| fx.hash_of(p));
        assert_eq!(table_b.successor(), Some(c));

        let mut table_c = RoutingTable::new(id(30), c, 6, DEFAULT_ROUTE_FALLBACK);
        table_c.insert(id(10), a, |p| fx.hash_of(p));
        table_c.insert(id(20), b, |p| fx.hash_of(p));
        assert_eq!(table_c.successor(), Some(a));
    }

    /// S4: finger correctness on a `bitcount = 6` ring with nodes at 1, 8,
    /// 14, 21, 32, 42. A single node's table only resolves locally or names
    /// the next hop ([`Lookup::Forward`], spec.md §4.2's recursion
    /// boundary); `find_successor(v) "from any node"` means following those
    /// hops across the ring until one table resolves locally, which is what
    /// `network_find_successor` below simulates.
    #[test]
    fn s4_finger_correctness() {
        let mut fx = Fixture::new();
        let nodes = [
            (PeerId::from_raw(1), id(1)),
            (PeerId::from_raw(2), id(8)),
            (PeerId::from_raw(3), id(14)),
            (PeerId::from_raw(4), id(21)),
            (PeerId::from_raw(5), id(32)),
            (PeerId::from_raw(6), id(42)),
        ];
        for (peer, hash) in nodes {
            fx.register(peer, hash);
        }

        let mut tables = HashMap::new();
        for (root_peer, root_hash) in nodes {
            let mut table = RoutingTable::new(root_hash, root_peer, 6, DEFAULT_ROUTE_FALLBACK);
            for (peer, hash) in nodes {
                if peer != root_peer {
                    table.insert(hash, peer, |p| fx.hash_of(p));
                }
            }
            tables.insert(root_peer, table);
        }

        fn network_find_successor(
            tables: &HashMap<PeerId, RoutingTable>,
            fx: &Fixture,
            start: PeerId,
            value: u128,
        ) -> PeerId {
            let mut current = start;
            loop {
                match tables[&current].find_successor(value, |p| fx.hash_of(p)) {
                    Lookup::Local(n) => return n,
                    Lookup::Forward(next) => current = next,
                }
            }
        }

        for (start, _) in nodes {
            assert_eq!(
                fx.hash_of(network_find_successor(&tables, &fx, start, 15)),
                id(21),
                "find_successor(15) from {:?} should land on 21",
                start
            );
            assert_eq!(
                fx.hash_of(network_find_successor(&tables, &fx, start, 42)),
                id(42),
                "find_successor(42) from {:?} should land on 42 itself",
                start
            );
            assert_eq!(
                fx.hash_of(network_find_successor(&tables, &fx, start, 43)),
                id(1),
                "find_successor(43) from {:?} should wrap to 1",
                start
            );
        }
    }
}
