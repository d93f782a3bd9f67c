//! Broadcast Emitter
//!
//! Fans lifecycle events out to every registered connection. Delivery is
//! fire-and-forget: each client has its own bounded queue and a full queue
//! is handled by the registry's slow-client policy, so emitting never waits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::client_registry::{BroadcastResult, ClientRegistry, ConnectionId};
use crate::messages::{OutboundMessage, StreamEvent};

/// Counters since the emitter was created
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmitterStats {
    /// Messages broadcast
    pub broadcasts: u64,
    /// Individual client deliveries that were queued
    pub delivered: u64,
    /// Individual client deliveries dropped (full or closed queue)
    pub dropped: u64,
    /// Clients removed by the slow-client policy
    pub disconnected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicU64,
}

/// Pushes outbound messages to connected clients
#[derive(Clone, Debug)]
pub struct BroadcastEmitter {
    clients: ClientRegistry,
    counters: Arc<Counters>,
}

impl BroadcastEmitter {
    /// Create an emitter over a client registry
    #[must_use]
    pub fn new(clients: ClientRegistry) -> Self {
        Self {
            clients,
            counters: Arc::new(Counters::default()),
        }
    }

    /// The client registry being broadcast to
    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Broadcast a stream lifecycle event
    pub fn emit(&self, event: StreamEvent) -> BroadcastResult {
        self.relay(OutboundMessage::StreamResponse(event))
    }

    /// Broadcast any outbound message
    pub fn relay(&self, message: OutboundMessage) -> BroadcastResult {
        let result = self.clients.broadcast(&message);

        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(result.delivered as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(result.dropped as u64, Ordering::Relaxed);
        self.counters
            .disconnected
            .fetch_add(result.disconnected.len() as u64, Ordering::Relaxed);

        if result.dropped > 0 {
            tracing::debug!(
                event = message.name(),
                delivered = result.delivered,
                dropped = result.dropped,
                "Broadcast dropped for slow or closed clients"
            );
        }
        result
    }

    /// Send a message to one connection only
    ///
    /// Returns true if it was queued.
    pub fn notify(&self, connection: &ConnectionId, message: OutboundMessage) -> bool {
        let queued = self.clients.send_to(connection, message);
        if queued {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            disconnected: self.counters.disconnected.load(Ordering::Relaxed),
        }
    }
}
