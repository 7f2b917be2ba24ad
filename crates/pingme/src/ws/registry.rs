//! Registry of live chat connections.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use pingme_protocol::MessageView;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Socket-level failures. Never shown to the remote party.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    /// The client is not draining its outbound buffer.
    #[error("outbound buffer full")]
    Backlogged,

    #[error("connection already registered")]
    AlreadyRegistered,

    #[error("websocket error: {0}")]
    Socket(String),
}

/// Key of a registered connection. Unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a connection, as seen by the delivery worker.
///
/// `deliver` must not block: the worker serves every connection in turn.
pub trait ConnectionSink: Send + Sync {
    fn deliver(&self, view: Arc<MessageView>) -> Result<(), TransportError>;

    /// Ask the connection to shut down. Called after a failed delivery.
    fn close(&self) {}
}

/// Counts from one pass of [`ConnectionRegistry::for_each`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failed: usize,
    /// Entries whose connection had already been dropped.
    pub pruned: usize,
}

/// Concurrent table of live connections.
///
/// Holds only weak references: the connection task owns its sink, so an
/// entry can never keep a dead socket alive.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Weak<dyn ConnectionSink>>,
    /// Sink address -> id, so a duplicate check and its insert are one step.
    sinks: DashMap<usize, ConnectionId>,
    next_id: AtomicU64,
}

/// Identity of a sink allocation. A registered `Weak` keeps the allocation
/// alive, so the address cannot be reused while the entry exists.
fn sink_key(sink: *const dyn ConnectionSink) -> usize {
    sink as *const () as usize
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            sinks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a sink and return its key.
    ///
    /// Fails if the same sink is already registered, including when two
    /// registrations race.
    pub fn register(&self, sink: &Arc<dyn ConnectionSink>) -> Result<ConnectionId, TransportError> {
        let weak = Arc::downgrade(sink);
        let id = match self.sinks.entry(sink_key(Arc::as_ptr(sink))) {
            Entry::Occupied(mut held) => {
                if self.connections.contains_key(held.get()) {
                    return Err(TransportError::AlreadyRegistered);
                }
                // Left behind by a prune; the sink is being registered anew.
                let id = self.allocate_id();
                self.connections.insert(id, weak);
                held.insert(id);
                id
            }
            Entry::Vacant(slot) => {
                let id = self.allocate_id();
                self.connections.insert(id, weak);
                slot.insert(id);
                id
            }
        };

        info!("Registered chat connection {} ({} live)", id, self.len());
        Ok(id)
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let removed = self.forget(id);
        if removed {
            info!("Deregistered chat connection {} ({} live)", id, self.len());
        }
        removed
    }

    /// Apply `f` to a snapshot of the registered connections.
    ///
    /// A connection for which `f` fails is deregistered and closed; the rest
    /// are still visited. No map lock is held while `f` runs.
    pub fn for_each<F>(&self, mut f: F) -> FanOutReport
    where
        F: FnMut(ConnectionId, &dyn ConnectionSink) -> Result<(), TransportError>,
    {
        let snapshot: Vec<(ConnectionId, Weak<dyn ConnectionSink>)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut report = FanOutReport::default();
        for (id, weak) in snapshot {
            let Some(sink) = weak.upgrade() else {
                debug!("Pruning dropped connection {}", id);
                self.forget(id);
                report.pruned += 1;
                continue;
            };

            match f(id, sink.as_ref()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Delivery to {} failed: {}", id, e);
                    self.deregister(id);
                    sink.close();
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn allocate_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn forget(&self, id: ConnectionId) -> bool {
        let Some((_, weak)) = self.connections.remove(&id) else {
            return false;
        };
        self.sinks
            .remove_if(&sink_key(weak.as_ptr()), |_, held| *held == id);
        true
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
