//! Client Registry - Connected Client Management
//!
//! This module tracks the clients currently connected to the gateway and
//! delivers outbound messages to them. It is the client set owned by the
//! connection manager (the daemon); the gateway only reads it to broadcast.
//!
//! # Architecture
//!
//! ```text
//!                       ClientRegistry
//!                     ┌───────────────────────────────────────┐
//!                     │ HashMap<ConnectionId, ClientHandle>   │
//!                     │   - wrapped in Arc<RwLock<>>          │
//!                     └───────────────┬───────────────────────┘
//!                                     │ try_send (bounded queue per client)
//!              ┌──────────────────────┼──────────────────────┐
//!              │                      │                      │
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │  browser A  │       │  browser B   │       │  capture app │
//!       │   conn-…    │       │   conn-…     │       │   conn-…     │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! # Slow Clients
//!
//! Every client has a bounded outbound queue. Delivery never waits: when a
//! queue is full the [`SlowClientPolicy`] decides whether the message is
//! dropped for that client or the client is disconnected.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::messages::OutboundMessage;

/// Unique identifier for a client connection
///
/// Each connection is assigned a random ID when it connects.
/// This ID is stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What to do with a client whose outbound queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowClientPolicy {
    /// Drop the message for that client only
    #[default]
    DropMessage,
    /// Unregister the client; its socket task ends when the queue closes
    Disconnect,
}

/// Handle to a connected client
#[derive(Debug)]
pub struct ClientHandle {
    /// Unique connection identifier
    pub id: ConnectionId,
    /// Bounded queue feeding this client's socket
    pub tx: mpsc::Sender<OutboundMessage>,
    /// When the client connected
    pub connected_at: Instant,
    /// Remote address, when known
    pub peer_addr: Option<SocketAddr>,
}

impl ClientHandle {
    /// Create a new client handle
    #[must_use]
    pub fn new(id: ConnectionId, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            peer_addr: None,
        }
    }

    /// Attach the remote address
    #[must_use]
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Check if the client's queue is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Get the connection uptime in seconds
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Number of clients that had the message queued
    pub delivered: usize,
    /// Number of clients that missed the message
    pub dropped: usize,
    /// IDs of clients that missed the message
    pub dropped_ids: Vec<ConnectionId>,
    /// IDs of clients unregistered during this broadcast
    pub disconnected: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if every client received the message
    #[must_use]
    pub fn all_delivered(&self) -> bool {
        self.dropped == 0
    }

    /// Check if nobody received the message
    #[must_use]
    pub fn none_delivered(&self) -> bool {
        self.delivered == 0
    }
}

/// Registry of connected clients
///
/// Thread-safe registry that allows concurrent read access while
/// serializing write operations (registering/unregistering clients).
/// Clones share the same client set.
#[derive(Clone)]
pub struct ClientRegistry {
    /// Inner map of connection ID to client handle
    inner: Arc<RwLock<HashMap<ConnectionId, ClientHandle>>>,
    /// Full-queue policy
    policy: SlowClientPolicy,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Create a new empty registry with the default slow-client policy
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(SlowClientPolicy::default())
    }

    /// Create a new empty registry with an explicit slow-client policy
    #[must_use]
    pub fn with_policy(policy: SlowClientPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    /// The slow-client policy in effect
    #[must_use]
    pub fn policy(&self) -> SlowClientPolicy {
        self.policy
    }

    /// Register a new client connection
    ///
    /// Returns the client's `ConnectionId`.
    pub fn register(&self, handle: ClientHandle) -> ConnectionId {
        let id = handle.id;
        let peer_addr = handle.peer_addr;
        self.inner.write().insert(id, handle);
        tracing::info!(connection_id = %id, peer = ?peer_addr, "Client registered");
        id
    }

    /// Unregister a client connection
    ///
    /// Returns the handle if it was registered. Dropping the handle closes
    /// the client's queue.
    pub fn unregister(&self, id: &ConnectionId) -> Option<ClientHandle> {
        let handle = self.inner.write().remove(id);
        if handle.is_some() {
            tracing::info!(connection_id = %id, "Client unregistered");
        }
        handle
    }

    /// Get the number of connected clients
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Get the IDs of all connected clients
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.read().keys().copied().collect()
    }

    /// Broadcast a message to all connected clients
    ///
    /// Never waits on a client. Full queues are handled by the registry's
    /// [`SlowClientPolicy`]; closed queues are always unregistered.
    pub fn broadcast(&self, message: &OutboundMessage) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        let mut to_remove = Vec::new();

        {
            let inner = self.inner.read();
            for (id, handle) in inner.iter() {
                match handle.tx.try_send(message.clone()) {
                    Ok(()) => result.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        result.dropped += 1;
                        result.dropped_ids.push(*id);
                        if self.policy == SlowClientPolicy::Disconnect {
                            to_remove.push(*id);
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        result.dropped += 1;
                        result.dropped_ids.push(*id);
                        to_remove.push(*id);
                    }
                }
            }
        }

        for id in to_remove {
            if self.unregister(&id).is_some() {
                tracing::warn!(connection_id = %id, "Dropped client with full or closed queue");
                result.disconnected.push(id);
            }
        }

        result
    }

    /// Send a message to a specific client
    ///
    /// Returns true if the message was queued.
    pub fn send_to(&self, id: &ConnectionId, message: OutboundMessage) -> bool {
        let inner = self.inner.read();
        if let Some(handle) = inner.get(id) {
            handle.tx.try_send(message).is_ok()
        } else {
            tracing::warn!(connection_id = %id, "Attempted to send to unknown connection");
            false
        }
    }

    /// Remove clients whose queue has been closed
    ///
    /// Returns the number of clients removed.
    pub fn cleanup_disconnected(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.len();

        inner.retain(|id, handle| {
            let connected = handle.is_connected();
            if !connected {
                tracing::info!(connection_id = %id, "Removing disconnected client");
            }
            connected
        });

        let removed = before - inner.len();
        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = inner.len(),
                "Cleaned up disconnected clients"
            );
        }
        removed
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ClientRegistry")
            .field("connection_count", &inner.len())
            .field("policy", &self.policy)
            .finish()
    }
}
