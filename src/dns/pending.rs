//! In-flight upstream queries.
//!
//! Each forwarded query owns the UDP socket it was sent from. The tracker is
//! bounded in both time and space: entries older than [`QUERY_TIMEOUT`] are
//! dropped before a new one is admitted, and once [`MAX_PENDING`] entries
//! are held the oldest is sacrificed. Dropping an entry closes its socket.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use futures::future::select_all;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

/// Maximum number of queries awaiting an upstream answer.
pub const MAX_PENDING: usize = 1024;

/// Age after which an unanswered query is given up.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest upstream answer read from a query socket.
pub const MAX_RESPONSE_SIZE: usize = 1024;

/// Turns a raw upstream answer into the packet written to the tunnel.
pub type ResponseCallback = Box<dyn FnOnce(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

struct PendingQuery {
    socket: UdpSocket,
    callback: ResponseCallback,
    created: Instant,
}

/// Bounded FIFO of queries waiting on their sockets.
pub struct PendingQueries {
    queries: VecDeque<PendingQuery>,
    capacity: usize,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Track a query sent from `socket`.
    pub fn add(&mut self, socket: UdpSocket, callback: ResponseCallback) {
        let now = Instant::now();
        let mut evicted = 0u64;

        while let Some(oldest) = self.queries.front() {
            if now.duration_since(oldest.created) <= QUERY_TIMEOUT {
                break;
            }
            self.queries.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            debug!(count = evicted, "Dropped timed out queries");
        }

        if self.queries.len() >= self.capacity {
            warn!(capacity = self.capacity, "Too many pending queries, dropping oldest");
            self.queries.pop_front();
            evicted += 1;
        }

        if evicted > 0 {
            metrics::counter!("nullroute_pending_evictions_total").increment(evicted);
        }

        self.queries.push_back(PendingQuery {
            socket,
            callback,
            created: now,
        });
    }

    /// Descriptors of every tracked socket, oldest first.
    pub fn descriptors(&self) -> Vec<RawFd> {
        self.queries
            .iter()
            .map(|query| query.socket.as_raw_fd())
            .collect()
    }

    /// Wait until at least one tracked socket is readable.
    ///
    /// Never completes while the tracker is empty.
    pub async fn wait_ready(&self) -> io::Result<()> {
        if self.queries.is_empty() {
            return std::future::pending().await;
        }
        let readiness = self
            .queries
            .iter()
            .map(|query| Box::pin(query.socket.readable()));
        let (result, _, _) = select_all(readiness).await;
        result
    }

    /// Answer every query whose socket has data.
    ///
    /// Each answered query is removed and its callback's packet appended to
    /// `out`. Queries whose read or callback fails are removed as well.
    /// Returns the number of queries removed.
    pub fn drain_completed(&mut self, out: &mut VecDeque<Vec<u8>>) -> usize {
        let mut buf = [0u8; MAX_RESPONSE_SIZE];
        let mut removed = 0;
        let mut index = 0;

        while index < self.queries.len() {
            let received = self.queries[index].socket.try_recv_from(&mut buf);
            if matches!(&received, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                index += 1;
                continue;
            }

            let Some(query) = self.queries.remove(index) else {
                break;
            };
            removed += 1;

            match received {
                Ok((len, _)) => match (query.callback)(&buf[..len]) {
                    Ok(packet) => out.push_back(packet),
                    Err(e) => warn!(error = %e, "Failed to assemble upstream answer"),
                },
                Err(e) => warn!(error = %e, "Failed to read upstream answer"),
            }
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every query, closing its socket.
    pub fn clear(&mut self) {
        self.queries.clear();
    }
}

impl Default for PendingQueries {
    fn default() -> Self {
        Self::new()
    }
}

/// An answer resolved off the event loop.
pub struct Completion {
    pub answer: Vec<u8>,
    pub callback: ResponseCallback,
}

impl Completion {
    /// Run the callback, producing the packet for the tunnel.
    pub fn assemble(self) -> Result<Vec<u8>> {
        (self.callback)(&self.answer)
    }
}

/// Bounded queue carrying [`Completion`]s back to the event loop.
pub fn completion_channel(
    capacity: usize,
) -> (mpsc::Sender<Completion>, mpsc::Receiver<Completion>) {
    mpsc::channel(capacity.max(1))
}
