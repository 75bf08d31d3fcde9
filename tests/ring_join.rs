//! End-to-end ring convergence over real loopback TCP sockets.
//!
//! Exercises a freshly-initialized single-node ring (no peers, own
//! successor) and a two-node join converging, through `stabilize()`, to
//! each node correctly pointing at the other.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chord::identifier::Md5HashSource;
use chord::node::{server, Config, LocalNode};

fn fast_config() -> Config {
    Config {
        stabilize_period: Duration::from_millis(20),
        fix_fingers_period: Duration::from_millis(50),
        join_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

fn spawn_node(config: Config) -> Arc<LocalNode> {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let tasks = server::spawn_worker_pool(4);
    let node = Arc::new(LocalNode::new(addr, Arc::new(Md5HashSource), config, tasks.clone()));

    server::spawn_tickers(Arc::clone(&node));
    let accept_node = Arc::clone(&node);
    thread::spawn(move || server::run_accept_loop(accept_node, listener, tasks));

    // Give the accept loop's spawned thread a moment to actually start
    // listening before the caller tries to connect.
    thread::sleep(Duration::from_millis(20));
    node
}

#[test]
fn single_node_ring_is_its_own_successor_with_no_predecessor() {
    let node = spawn_node(fast_config());
    assert_eq!(node.successor_addr(), node.listener_addr());
    assert_eq!(node.predecessor_addr(), None);
    assert_eq!(node.real_length(), 0);
}

#[test]
fn two_node_join_converges_to_mutual_successor_predecessor() {
    let a = spawn_node(fast_config());
    let b = spawn_node(fast_config());

    b.join(a.listener_addr()).expect("join should succeed against a reachable entry node");

    // join() alone sets b's successor synchronously; a learns of b only
    // once the JOIN_REQ is processed off the worker pool, and a's
    // successor only becomes b once stabilize()/notify() converge.
    let deadline = Duration::from_secs(2);
    let step = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if a.successor_addr() == b.listener_addr() && a.predecessor_addr() == Some(b.listener_addr()) {
            break;
        }
        thread::sleep(step);
        waited += step;
    }

    assert_eq!(b.successor_addr(), a.listener_addr());
    assert_eq!(a.predecessor_addr(), Some(b.listener_addr()));
    assert_eq!(a.successor_addr(), b.listener_addr());
}

/// S5: three nodes converge (A<->B<->C<->A), then C is dropped by closing
/// every connection to it. Within a handful of stabilize periods, A and B
/// should re-converge to a two-node ring with no trace of C.
#[test]
fn three_node_ring_heals_after_a_node_departs() {
    let a = spawn_node(fast_config());
    let b = spawn_node(fast_config());
    let c = spawn_node(fast_config());

    b.join(a.listener_addr()).expect("b joins a");
    c.join(a.listener_addr()).expect("c joins a");

    let deadline = Duration::from_secs(3);
    let step = Duration::from_millis(20);

    let ring_converged = |nodes: &[&Arc<LocalNode>]| {
        nodes.iter().all(|n| {
            let succ = n.successor_addr();
            nodes.iter().any(|other| other.listener_addr() == succ)
                && n.predecessor_addr().is_some()
        })
    };

    let mut waited = Duration::ZERO;
    while waited < deadline {
        if ring_converged(&[&a, &b, &c]) {
            break;
        }
        thread::sleep(step);
        waited += step;
    }
    assert!(ring_converged(&[&a, &b, &c]), "three-node ring failed to converge");

    // Simulate C leaving abruptly: its peers observe the close via their
    // reader threads and evict it through `on_connection_close`.
    c.shutdown();

    let mut waited = Duration::ZERO;
    while waited < deadline {
        let a_ok = a.successor_addr() == b.listener_addr() || a.successor_addr() == a.listener_addr();
        let b_ok = b.successor_addr() == a.listener_addr() || b.successor_addr() == b.listener_addr();
        if a_ok && b_ok && ring_converged(&[&a, &b]) {
            break;
        }
        thread::sleep(step);
        waited += step;
    }

    assert_eq!(a.successor_addr(), b.listener_addr());
    assert_eq!(b.successor_addr(), a.listener_addr());
    assert_eq!(a.predecessor_addr(), Some(b.listener_addr()));
    assert_eq!(b.predecessor_addr(), Some(a.listener_addr()));

    assert!(!a.seen_peer_addrs().contains(&c.listener_addr()), "a should have forgotten c");
    assert!(!b.seen_peer_addrs().contains(&c.listener_addr()), "b should have forgotten c");
}
