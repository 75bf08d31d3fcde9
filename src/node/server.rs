//! Accept loop, worker pool, and periodic tickers.
//!
//! Generalizes the teacher's `spawn_background_threads` (an
//! `mpsc`-fed pool of worker threads draining boxed closures) and the
//! `main.rs` accept loop / `run_network_stabilization` into a Chord-state-
//! machine-agnostic runtime: each accepted or outbound connection gets its
//! own reader thread, which decodes frames and hands them to the shared
//! worker pool for dispatch, keeping socket reads off the pool so a slow
//! handler never blocks other connections' reads.

use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::peer::PeerId;
use crate::protocol::read_frame;

use super::LocalNode;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Spawns `n` worker threads draining a shared task queue. Mirrors the
/// teacher's `spawn_background_threads`.
pub fn spawn_worker_pool(n: usize) -> Sender<Task> {
    let (sender, receiver) = mpsc::channel::<Task>();
    let receiver = Arc::new(Mutex::new(receiver));

    for _ in 0..n {
        let receiver = Arc::clone(&receiver);
        thread::spawn(move || loop {
            let task = {
                let receiver_lock = receiver.lock().unwrap();
                match receiver_lock.recv() {
                    Ok(task) => task,
                    Err(_) => return,
                }
            };
            task();
        });
    }

    sender
}

/// Reads frames off `stream` for as long as the connection stays open,
/// dispatching each to `local` via the worker pool. Evicts `peer_id` on
/// read error or clean close.
pub fn spawn_reader(local: Arc<LocalNode>, peer_id: PeerId, mut stream: TcpStream, tasks: Sender<Task>) {
    thread::spawn(move || loop {
        match read_frame(&mut stream) {
            Ok((corr_id, message)) => {
                let local = Arc::clone(&local);
                let sent = tasks.send(Box::new(move || local.on_frame(peer_id, corr_id, message)));
                if sent.is_err() {
                    local.on_connection_close(peer_id);
                    return;
                }
            }
            Err(err) => {
                log::debug!("connection to peer closed: {}", err);
                local.on_connection_close(peer_id);
                return;
            }
        }
    });
}

/// Accepts inbound connections on `listener` for the lifetime of the
/// process, registering each with `local` and spawning its reader thread.
/// Mirrors the teacher's `main.rs` `for stream in local_listener.incoming()`
/// loop.
pub fn run_accept_loop(local: Arc<LocalNode>, listener: TcpListener, tasks: Sender<Task>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("failed to accept a connection: {}", err);
                continue;
            }
        };

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                log::warn!("failed to clone an accepted connection: {}", err);
                continue;
            }
        };

        match local.register_inbound(stream) {
            Ok(peer_id) => spawn_reader(Arc::clone(&local), peer_id, reader, tasks.clone()),
            Err(err) => log::warn!("failed to register an accepted connection: {}", err),
        }
    }
}

/// Spawns the `stabilize`/`fix_fingers` periodic tickers. Mirrors the
/// teacher's `run_network_stabilization`, split into two independently-paced
/// threads since `fix_fingers` runs on a longer period than `stabilize`.
pub fn spawn_tickers(local: Arc<LocalNode>) {
    let stabilize_period = local.config().stabilize_period;
    let stabilize_node = Arc::clone(&local);
    thread::spawn(move || loop {
        stabilize_node.stabilize();
        thread::sleep(stabilize_period);
    });

    let fix_fingers_period = local.config().fix_fingers_period;
    thread::spawn(move || loop {
        local.fix_fingers();
        thread::sleep(fix_fingers_period);
    });
}
