//! Session Bookkeeping
//!
//! A session is the short-lived record of one request-to-answer exchange.
//! It is created when a request is admitted, moves to `Streaming` once the
//! upstream accepts the call, and is dropped from the registry right after
//! its terminal event. Nothing here is persisted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client_registry::ConnectionId;
use crate::events::{Request, RequestKind};

/// Registry key of a session
///
/// Sessions are scoped by `(id, type)`: the same client id may be in flight
/// once per request kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Client-chosen request id
    pub id: String,
    /// Request kind
    pub kind: RequestKind,
}

impl SessionKey {
    /// Create a key
    pub fn new(id: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Admitted, upstream not yet accepted
    Created,
    /// Upstream accepted; deltas are being relayed
    Streaming,
    /// Upstream finished normally
    Completed,
    /// Upstream failed or timed out
    Failed,
    /// Consumption stopped because the originating client went away
    Cancelled,
}

impl SessionState {
    /// Whether the state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::{Cancelled, Completed, Created, Failed, Streaming};
        matches!(
            (self, next),
            (Created, Streaming | Failed | Cancelled)
                | (Streaming, Completed | Failed | Cancelled)
        )
    }
}

/// A session record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Request id
    pub id: String,
    /// Request kind
    pub kind: RequestKind,
    /// Question text
    pub text: String,
    /// Lifecycle state
    pub state: SessionState,
    /// When the session was admitted
    pub created_at: DateTime<Utc>,
    /// Connection that sent the request, if it came from one
    pub origin: Option<ConnectionId>,
}

impl Session {
    /// Create a session for an admitted request
    #[must_use]
    pub fn new(request: &Request, origin: Option<ConnectionId>) -> Self {
        Self {
            id: request.id.clone(),
            kind: request.kind,
            text: request.text.clone(),
            state: SessionState::Created,
            created_at: Utc::now(),
            origin,
        }
    }

    /// Registry key of this session
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.id.clone(), self.kind)
    }

    /// Move to `next` if the transition is legal
    ///
    /// Returns false (and leaves the state untouched) otherwise.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                session = %self.key(),
                from = ?self.state,
                to = ?next,
                "Ignoring illegal session transition"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new("q-1", RequestKind::Screenshot, "What is ownership?")
    }

    #[test]
    fn test_session_new() {
        let session = Session::new(&request(), None);
        assert_eq!(session.state, SessionState::Created);
        assert_eq!(session.id, "q-1");
        assert_eq!(session.text, "What is ownership?");
        assert_eq!(session.key(), SessionKey::new("q-1", RequestKind::Screenshot));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut session = Session::new(&request(), None);
        assert!(session.transition(SessionState::Streaming));
        assert!(session.transition(SessionState::Completed));
        assert!(session.state.is_terminal());
    }

    #[test]
    fn test_failure_before_streaming() {
        let mut session = Session::new(&request(), None);
        assert!(session.transition(SessionState::Failed));
        assert_eq!(session.state, SessionState::Failed);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut session = Session::new(&request(), None);
        session.transition(SessionState::Streaming);
        session.transition(SessionState::Failed);

        assert!(!session.transition(SessionState::Completed));
        assert!(!session.transition(SessionState::Streaming));
        assert_eq!(session.state, SessionState::Failed);
    }

    #[test]
    fn test_cannot_complete_without_streaming() {
        let mut session = Session::new(&request(), None);
        assert!(!session.transition(SessionState::Completed));
        assert_eq!(session.state, SessionState::Created);
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new("abc", RequestKind::Audio);
        assert_eq!(key.to_string(), "audio:abc");
    }
}
