//! Tunables for a running node (spec.md §6), with defaults matching the
//! teacher's hardcoded constants (`RING_BIT_LENGTH`, `SUCCESSOR_LIST_LENGTH`)
//! where the teacher had an equivalent, and the Chord paper's usual
//! defaults otherwise.

use std::net::SocketAddr;
use std::time::Duration;

use crate::identifier::DEFAULT_BITCOUNT;
use crate::routing::DEFAULT_ROUTE_FALLBACK;

/// Runtime configuration for a [`crate::node::LocalNode`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Width, in bits, of the identifier ring. Must equal `8 * HASHLEN` in
    /// production; a smaller value is only meaningful with a matching test
    /// hash source.
    pub bitcount: u32,
    /// Candidate-list length (`K`) for each routing table entry.
    pub route_fallback: usize,
    /// Interval between `stabilize()` ticks.
    pub stabilize_period: Duration,
    /// Interval between `fix_fingers()` ticks.
    pub fix_fingers_period: Duration,
    /// Deadline for `join()`'s initial JOIN_REQ round trip.
    pub join_timeout: Duration,
    /// Deadline for any other correlated request.
    pub request_timeout: Duration,
    /// Local address the listener binds to.
    pub listener_bind: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bitcount: DEFAULT_BITCOUNT,
            route_fallback: DEFAULT_ROUTE_FALLBACK,
            stabilize_period: Duration::from_secs(1),
            fix_fingers_period: Duration::from_secs(5),
            join_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            listener_bind: "0.0.0.0:0".parse().unwrap(),
        }
    }
}
