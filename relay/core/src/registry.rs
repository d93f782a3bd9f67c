//! Session Registry
//!
//! Tracks in-flight sessions keyed by `(id, type)`. The registry is the only
//! shared mutable state of the gateway; it is an explicit object handed to
//! the gateway, never a process-wide global.
//!
//! # Guarantees
//!
//! - Concurrent create/lookup/remove never corrupt the map (`DashMap`
//!   shards the lock).
//! - At most `max_sessions` sessions are in flight. Creation beyond that is
//!   rejected, not queued.
//! - An active key is never overwritten. A second request with the same
//!   `(id, type)` is rejected until the first one retires.
//! - Every admitted session is owned by a [`SessionHandle`]; dropping the
//!   handle retires the session, so no exit path can leak an entry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client_registry::ConnectionId;
use crate::events::Request;
use crate::session::{Session, SessionKey, SessionState};

/// Default bound on in-flight sessions
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Why a session could not be created
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Too many sessions in flight
    #[error("session limit reached ({max} in flight)")]
    AtCapacity {
        /// The configured bound
        max: usize,
    },
    /// A session with the same key is still in flight
    #[error("session {0} is already in flight")]
    Duplicate(SessionKey),
}

struct SessionEntry {
    session: Session,
    cancel: CancellationToken,
    generation: u64,
}

struct Inner {
    sessions: DashMap<SessionKey, SessionEntry>,
    in_flight: AtomicUsize,
    next_generation: AtomicU64,
    max_sessions: usize,
}

/// Concurrent registry of in-flight sessions
///
/// Clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    /// Create a registry admitting at most `max_sessions` concurrent sessions
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                next_generation: AtomicU64::new(1),
                max_sessions,
            }),
        }
    }

    /// The admission bound
    #[must_use]
    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions
    }

    /// Admit a session for `request`
    ///
    /// # Errors
    ///
    /// - [`RegistryError::AtCapacity`] when `max_sessions` are in flight
    /// - [`RegistryError::Duplicate`] when the request's key is in flight
    pub fn create(
        &self,
        request: &Request,
        origin: Option<ConnectionId>,
    ) -> Result<SessionHandle, RegistryError> {
        let max = self.inner.max_sessions;
        self.inner
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| RegistryError::AtCapacity { max })?;

        let key = request.key();
        match self.inner.sessions.entry(key.clone()) {
            Entry::Occupied(_) => {
                self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(RegistryError::Duplicate(key))
            }
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(SessionEntry {
                    session: Session::new(request, origin),
                    cancel: cancel.clone(),
                    generation,
                });
                tracing::debug!(session = %key, origin = ?origin, "Session registered");
                Ok(SessionHandle {
                    key,
                    cancel,
                    generation,
                    registry: self.clone(),
                })
            }
        }
    }

    /// Snapshot of the session stored under `key`
    #[must_use]
    pub fn lookup(&self, key: &SessionKey) -> Option<Session> {
        self.inner.sessions.get(key).map(|e| e.session.clone())
    }

    /// Snapshots of every in-flight session with this id, across kinds
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Vec<Session> {
        self.inner
            .sessions
            .iter()
            .filter(|e| e.key().id == id)
            .map(|e| e.session.clone())
            .collect()
    }

    /// Remove the session stored under `key`
    ///
    /// Its cancellation token is not triggered; the owning task keeps its
    /// handle but the handle no longer refers to a registered session.
    pub fn remove(&self, key: &SessionKey) -> Option<Session> {
        let (_, entry) = self.inner.sessions.remove(key)?;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(session = %key, "Session removed");
        Some(entry.session)
    }

    /// Move the session under `key` to `state`
    ///
    /// Returns false if the session is unknown or the transition is illegal.
    pub fn set_state(&self, key: &SessionKey, state: SessionState) -> bool {
        self.inner
            .sessions
            .get_mut(key)
            .is_some_and(|mut e| e.session.transition(state))
    }

    /// Number of sessions in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether no session is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Cancel every session started by `origin`
    ///
    /// Returns the number of sessions signalled. The owning tasks retire the
    /// sessions themselves after emitting their terminal event.
    pub fn cancel_origin(&self, origin: ConnectionId) -> usize {
        let mut cancelled = 0;
        for entry in self.inner.sessions.iter() {
            if entry.session.origin == Some(origin) && !entry.cancel.is_cancelled() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(
                connection_id = %origin,
                cancelled,
                "Cancelled sessions of departed client"
            );
        }
        cancelled
    }

    /// Cancel every in-flight session
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.inner.sessions.iter() {
            if !entry.cancel.is_cancelled() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    fn retire(&self, key: &SessionKey, generation: u64) {
        let removed = self
            .inner
            .sessions
            .remove_if(key, |_, e| e.generation == generation);
        if removed.is_some() {
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(session = %key, "Session retired");
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("in_flight", &self.len())
            .field("max_sessions", &self.inner.max_sessions)
            .finish()
    }
}

/// Ownership of one admitted session
///
/// Dropping the handle removes the session from the registry.
pub struct SessionHandle {
    key: SessionKey,
    cancel: CancellationToken,
    generation: u64,
    registry: SessionRegistry,
}

impl SessionHandle {
    /// Registry key of the session
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Token cancelled when the session should stop early
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move the session to `state`
    ///
    /// A handle whose session was removed does not touch a newer session
    /// registered under the same key.
    pub fn set_state(&self, state: SessionState) -> bool {
        self.registry
            .inner
            .sessions
            .get_mut(&self.key)
            .filter(|e| e.generation == self.generation)
            .is_some_and(|mut e| e.session.transition(state))
    }

    /// Current snapshot of the session
    #[must_use]
    pub fn snapshot(&self) -> Option<Session> {
        self.registry
            .inner
            .sessions
            .get(&self.key)
            .filter(|e| e.generation == self.generation)
            .map(|e| e.session.clone())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.retire(&self.key, self.generation);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestKind;

    fn request(id: &str) -> Request {
        Request::new(id, RequestKind::Screenshot, "question")
    }

    #[test]
    fn test_create_and_lookup() {
        let registry = SessionRegistry::new(4);
        let handle = registry.create(&request("a"), None).unwrap();

        let session = registry.lookup(handle.key()).unwrap();
        assert_eq!(session.id, "a");
        assert_eq!(session.state, SessionState::Created);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drop_retires_session() {
        let registry = SessionRegistry::new(4);
        let handle = registry.create(&request("a"), None).unwrap();
        let key = handle.key().clone();

        drop(handle);

        assert!(registry.lookup(&key).is_none());
        assert!(registry.find_by_id("a").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_active_key_rejected() {
        let registry = SessionRegistry::new(4);
        let _first = registry.create(&request("a"), None).unwrap();

        let err = registry.create(&request("a"), None).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate(SessionKey::new("a", RequestKind::Screenshot))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_id_different_kind_admitted() {
        let registry = SessionRegistry::new(4);
        let _shot = registry.create(&request("a"), None).unwrap();
        let _audio = registry
            .create(&Request::new("a", RequestKind::Audio, "q"), None)
            .unwrap();

        assert_eq!(registry.find_by_id("a").len(), 2);
    }

    #[test]
    fn test_key_reusable_after_retire() {
        let registry = SessionRegistry::new(4);
        drop(registry.create(&request("a"), None).unwrap());
        assert!(registry.create(&request("a"), None).is_ok());
    }

    #[test]
    fn test_capacity_bound() {
        let registry = SessionRegistry::new(2);
        let first = registry.create(&request("a"), None).unwrap();
        let _second = registry.create(&request("b"), None).unwrap();

        assert_eq!(
            registry.create(&request("c"), None).unwrap_err(),
            RegistryError::AtCapacity { max: 2 }
        );

        drop(first);
        assert!(registry.create(&request("c"), None).is_ok());
    }

    #[test]
    fn test_duplicate_does_not_consume_capacity() {
        let registry = SessionRegistry::new(2);
        let _first = registry.create(&request("a"), None).unwrap();
        for _ in 0..5 {
            assert!(registry.create(&request("a"), None).is_err());
        }
        assert!(registry.create(&request("b"), None).is_ok());
    }

    #[test]
    fn test_stale_handle_does_not_remove_successor() {
        let registry = SessionRegistry::new(4);
        let stale = registry.create(&request("a"), None).unwrap();
        let key = stale.key().clone();

        registry.remove(&key);
        let fresh = registry.create(&request("a"), None).unwrap();
        drop(stale);

        assert!(registry.lookup(&key).is_some());
        assert!(fresh.snapshot().is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_handle_does_not_change_successor_state() {
        let registry = SessionRegistry::new(4);
        let stale = registry.create(&request("a"), None).unwrap();
        let key = stale.key().clone();

        registry.remove(&key);
        let fresh = registry.create(&request("a"), None).unwrap();

        assert!(!stale.set_state(SessionState::Streaming));
        assert_eq!(registry.lookup(&key).unwrap().state, SessionState::Created);
        assert!(fresh.set_state(SessionState::Streaming));
        assert_eq!(registry.lookup(&key).unwrap().state, SessionState::Streaming);
    }

    #[test]
    fn test_set_state_through_handle() {
        let registry = SessionRegistry::new(4);
        let handle = registry.create(&request("a"), None).unwrap();

        assert!(handle.set_state(SessionState::Streaming));
        assert_eq!(handle.snapshot().unwrap().state, SessionState::Streaming);
        assert!(!handle.set_state(SessionState::Created));
    }

    #[test]
    fn test_cancel_origin_only_hits_that_connection() {
        let registry = SessionRegistry::new(4);
        let conn_a = ConnectionId::new();
        let conn_b = ConnectionId::new();
        let a = registry.create(&request("a"), Some(conn_a)).unwrap();
        let b = registry.create(&request("b"), Some(conn_b)).unwrap();
        let anonymous = registry.create(&request("c"), None).unwrap();

        assert_eq!(registry.cancel_origin(conn_a), 1);
        assert!(a.cancellation().is_cancelled());
        assert!(!b.cancellation().is_cancelled());
        assert!(!anonymous.cancellation().is_cancelled());

        // Already-cancelled sessions are not counted twice.
        assert_eq!(registry.cancel_origin(conn_a), 0);
    }

    #[test]
    fn test_cancel_all() {
        let registry = SessionRegistry::new(4);
        let a = registry.create(&request("a"), None).unwrap();
        let b = registry.create(&request("b"), None).unwrap();

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.cancellation().is_cancelled());
        assert!(b.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_create_and_drop() {
        use tokio::task::JoinSet;

        let registry = SessionRegistry::new(1000);
        let mut join_set = JoinSet::new();

        for i in 0..200 {
            let registry = registry.clone();
            join_set.spawn(async move {
                let handle = registry.create(&request(&format!("req-{i}")), None).unwrap();
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    drop(handle);
                    None
                } else {
                    Some(handle)
                }
            });
        }

        let mut kept = Vec::new();
        while let Some(result) = join_set.join_next().await {
            if let Some(handle) = result.unwrap() {
                kept.push(handle);
            }
        }

        assert_eq!(kept.len(), 100);
        assert_eq!(registry.len(), 100);
        drop(kept);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_admit_exactly_one() {
        use tokio::task::JoinSet;

        let registry = SessionRegistry::new(64);
        let mut join_set = JoinSet::new();
        for _ in 0..32 {
            let registry = registry.clone();
            join_set.spawn(async move { registry.create(&request("same"), None) });
        }

        let mut admitted = Vec::new();
        while let Some(result) = join_set.join_next().await {
            if let Ok(handle) = result.unwrap() {
                admitted.push(handle);
            }
        }
        assert_eq!(admitted.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
