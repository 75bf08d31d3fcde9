//! Request/response correlation over a single connection (spec.md §4.4).
//!
//! The teacher's connections are request-then-immediately-read-reply, one
//! outstanding call at a time, matched implicitly by program order
//! (`send_and_receive_message` in `chord/mod.rs`). The binary protocol here
//! instead tags every frame with a correlation id, which a connection's
//! reader thread can dispatch to whichever caller is blocked waiting on it
//! — allowing a peer's own incoming requests to interleave with our
//! outstanding ones on the same socket.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use super::{write_frame, Message};
use crate::errors::{FrameError, RequestError};

/// Bound on outstanding requests per connection, guarding against an
/// unbounded `pending` map if a peer never replies.
pub const MAX_OUTSTANDING: usize = 64;

/// What a pending request's channel carries: either the matching response,
/// or an explicit cancellation (spec.md §5: shutdown delivers a shutdown
/// error to every outstanding caller, rather than letting each one sit
/// until its own timeout expires).
enum Delivery {
    Response(Message),
    Cancelled,
}

/// Matches responses to requests by correlation id, for one connection.
///
/// A single `Correlator` is shared (behind an `Arc`) between the thread
/// that calls [`Correlator::request`] and the connection's reader thread,
/// which feeds every frame it reads through [`Correlator::dispatch_incoming`].
pub struct Correlator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, mpsc::Sender<Delivery>>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn next_corr_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of requests currently awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Writes `message` on `writer` under a freshly allocated correlation
    /// id, then blocks the calling thread up to `timeout` for a matching
    /// response. Requires a reader thread on the same connection to be
    /// concurrently draining frames into [`Correlator::dispatch_incoming`].
    ///
    /// `addr` is only used to label a timeout error; it need not be the
    /// connection's literal peer address.
    pub fn request<W: Write>(
        &self,
        writer: &mut W,
        message: &Message,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Message, RequestError> {
        let corr_id = self.next_corr_id();
        let (tx, rx) = mpsc::channel();

        {
            let mut pending = self.pending.lock().unwrap();
            if pending.len() >= MAX_OUTSTANDING {
                return Err(RequestError::TooManyOutstanding);
            }
            pending.insert(corr_id, tx);
        }

        if let Err(e) = write_frame(writer, corr_id, message) {
            self.pending.lock().unwrap().remove(&corr_id);
            return Err(FrameError::Io(e).into());
        }

        match rx.recv_timeout(timeout) {
            Ok(Delivery::Response(response)) => Ok(response),
            Ok(Delivery::Cancelled) => Err(RequestError::Cancelled),
            Err(_) => {
                self.pending.lock().unwrap().remove(&corr_id);
                Err(RequestError::Timeout {
                    addr,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Cancels every outstanding request on this connection, delivering
    /// [`RequestError::Cancelled`] to each blocked caller immediately
    /// rather than leaving them to expire on their own deadlines. Called
    /// once per connection at shutdown.
    pub fn cancel_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, tx) in pending {
            let _ = tx.send(Delivery::Cancelled);
        }
    }

    /// Feeds one incoming `(corr_id, message)` pair read off the wire.
    ///
    /// - If a caller is blocked in [`Correlator::request`] on this id, the
    ///   message is delivered to it and `None` is returned: it was a
    ///   response, already handled.
    /// - If the message is shaped like a response (per
    ///   [`crate::protocol::MessageType::is_response`]) but nothing is
    ///   waiting on its id, it arrived after its request already timed out;
    ///   it is discarded and `None` is returned.
    /// - Otherwise it is a fresh, unsolicited request from the peer, and is
    ///   handed back as `Some((corr_id, message))` so the caller can act as
    ///   a server for it and reply reusing the same corr_id.
    pub fn dispatch_incoming(&self, corr_id: u32, message: Message) -> Option<(u32, Message)> {
        let waiter = self.pending.lock().unwrap().remove(&corr_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Delivery::Response(message));
                None
            }
            None if message.message_type().is_response() => None,
            None => Some((corr_id, message)),
        }
    }
}

/// Replies to an unsolicited request, reusing its correlation id.
pub fn respond<W: Write>(writer: &mut W, corr_id: u32, message: &Message) -> std::io::Result<()> {
    write_frame(writer, corr_id, message)
}
