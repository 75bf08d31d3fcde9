//! A Chord distributed hash table node.
//!
//! [`identifier`] carries the ring's fixed-width arithmetic, [`routing`]
//! the per-node finger table, [`peer`] the registry of connected remote
//! nodes, [`protocol`] the wire envelope and request/response correlation,
//! [`node`] the Chord state machine and its network runtime, and [`cli`]
//! the command-line entry points.

pub mod cli;
pub mod errors;
pub mod identifier;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod routing;
