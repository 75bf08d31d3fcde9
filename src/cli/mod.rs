//! Command-line arguments for a Chord node.
//!
//! Generalizes the teacher's hand-rolled `Args::parse` (manual
//! `env::args().skip(1)` walking with `"key=value".split()`) into a
//! `clap`-derived parser, keeping the same two actions
//! (`init`/`join`) and the same three positional concerns
//! (self-port, public address, remote entry address), plus the ring
//! tunables spec.md §6 exposes as configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::node::Config;

#[derive(Parser, Debug)]
#[command(name = "chord-node", about = "Runs a Chord distributed hash table node")]
pub struct Cli {
    #[command(subcommand)]
    pub action: Action,

    /// Width, in bits, of the identifier ring.
    #[arg(long, global = true, default_value_t = crate::identifier::DEFAULT_BITCOUNT)]
    pub bitcount: u32,

    /// Candidate-list length kept per finger-table entry.
    #[arg(long, global = true, default_value_t = crate::routing::DEFAULT_ROUTE_FALLBACK)]
    pub route_fallback: usize,

    /// Seconds between stabilize() ticks.
    #[arg(long, global = true, default_value_t = 1)]
    pub stabilize_period_secs: u64,

    /// Seconds between fix_fingers() ticks.
    #[arg(long, global = true, default_value_t = 5)]
    pub fix_fingers_period_secs: u64,

    /// Seconds before a join request gives up.
    #[arg(long, global = true, default_value_t = 10)]
    pub join_timeout_secs: u64,

    /// Seconds before any other correlated request gives up.
    #[arg(long, global = true, default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Worker threads draining the incoming-request queue.
    #[arg(long, global = true, default_value_t = 10)]
    pub worker_threads: usize,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Action {
    /// Starts a new Chord ring.
    Init {
        /// Local port to listen on.
        #[arg(long)]
        self_port: u16,
        /// Address other peers use to reach this node.
        #[arg(long)]
        public_addr: SocketAddr,
    },
    /// Joins an existing Chord ring through `remote_addr`.
    Join {
        #[arg(long)]
        self_port: u16,
        #[arg(long)]
        public_addr: SocketAddr,
        /// Address of any node already in the ring.
        #[arg(long)]
        remote_addr: SocketAddr,
    },
}

impl Cli {
    pub fn self_port(&self) -> u16 {
        match self.action {
            Action::Init { self_port, .. } => self_port,
            Action::Join { self_port, .. } => self_port,
        }
    }

    pub fn public_addr(&self) -> SocketAddr {
        match self.action {
            Action::Init { public_addr, .. } => public_addr,
            Action::Join { public_addr, .. } => public_addr,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self.action {
            Action::Init { .. } => None,
            Action::Join { remote_addr, .. } => Some(remote_addr),
        }
    }

    pub fn to_config(&self) -> Config {
        Config {
            bitcount: self.bitcount,
            route_fallback: self.route_fallback,
            stabilize_period: Duration::from_secs(self.stabilize_period_secs),
            fix_fingers_period: Duration::from_secs(self.fix_fingers_period_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            listener_bind: SocketAddr::new("0.0.0.0".parse().unwrap(), self.self_port()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn init_parses_required_fields() {
        let cli = Cli::parse_from([
            "chord-node",
            "init",
            "--self-port",
            "2017",
            "--public-addr",
            "127.0.0.1:2017",
        ]);
        assert_eq!(cli.self_port(), 2017);
        assert_eq!(cli.remote_addr(), None);
    }

    #[test]
    fn join_parses_remote_addr() {
        let cli = Cli::parse_from([
            "chord-node",
            "join",
            "--self-port",
            "2018",
            "--public-addr",
            "127.0.0.1:2018",
            "--remote-addr",
            "127.0.0.1:2017",
        ]);
        assert_eq!(cli.remote_addr(), Some("127.0.0.1:2017".parse().unwrap()));
    }

    #[test]
    fn tunables_default_to_spec_values() {
        let cli = Cli::parse_from([
            "chord-node",
            "init",
            "--self-port",
            "2017",
            "--public-addr",
            "127.0.0.1:2017",
        ]);
        assert_eq!(cli.bitcount, crate::identifier::DEFAULT_BITCOUNT);
        assert_eq!(cli.route_fallback, crate::routing::DEFAULT_ROUTE_FALLBACK);
    }
}
