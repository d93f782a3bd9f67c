//! Stream Orchestrator
//!
//! The gateway admits questions, runs one upstream stream per admitted
//! request and broadcasts the lifecycle of each:
//!
//! ```text
//! streaming_event ──► admit (registry) ──► start ──► open upstream
//!                          │                              │
//!                     rejected ──► request_rejected       ▼
//!                     (origin only)            streaming × N (in order)
//!                                                         │
//!                                               end (success | failure)
//!                                                         │
//!                                                   session retired
//! ```
//!
//! Each session runs in its own task, so sessions interleave freely while
//! each one's events stay in order. Upstream failures, timeouts and
//! cancellation all end in exactly one `end` event and never escape the
//! session task.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::backend::{LlmBackend, LlmRequest, StreamingToken, DEFAULT_MODEL};
use crate::client_registry::ConnectionId;
use crate::config::{ConfigError, RelayConfig};
use crate::emitter::BroadcastEmitter;
use crate::events::{ClientEvent, Request};
use crate::messages::{OutboundMessage, RejectionNotice, StreamEvent};
use crate::prompt::PromptTemplate;
use crate::registry::{RegistryError, SessionHandle, SessionRegistry, DEFAULT_MAX_SESSIONS};
use crate::session::SessionState;

/// Terminal message for sessions stopped by cancellation
pub const CANCELLED_MESSAGE: &str = "request cancelled";

/// Terminal message when the upstream channel closes without a result
pub const UNEXPECTED_CLOSE_MESSAGE: &str = "upstream stream closed unexpectedly";

/// Gateway behaviour settings
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Upstream model identifier
    pub model: String,
    /// Upstream sampling temperature
    pub temperature: f32,
    /// Bound on in-flight sessions
    pub max_sessions: usize,
    /// Cancel a connection's sessions when it disconnects
    pub cancel_on_disconnect: bool,
    /// Limit on the wait for the first upstream delta
    pub first_token_timeout: Option<Duration>,
    /// Limit on the gap between upstream deltas
    pub idle_timeout: Option<Duration>,
    /// Prompt wrapped around each question
    pub prompt: PromptTemplate,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            max_sessions: DEFAULT_MAX_SESSIONS,
            cancel_on_disconnect: true,
            first_token_timeout: Some(Duration::from_secs(60)),
            idle_timeout: Some(Duration::from_secs(60)),
            prompt: PromptTemplate::default(),
        }
    }
}

impl GatewayConfig {
    /// Derive gateway settings from the relay configuration
    ///
    /// A timeout of 0 seconds disables that timeout.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an unusable prompt template.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Ok(Self {
            model: config.backend.model.clone(),
            temperature: config.backend.temperature,
            max_sessions: config.gateway.max_sessions,
            cancel_on_disconnect: config.gateway.cancel_on_disconnect,
            first_token_timeout: secs(config.gateway.first_token_timeout_secs),
            idle_timeout: secs(config.gateway.idle_timeout_secs),
            prompt: config.prompt_template()?,
        })
    }
}

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request was not admitted
    #[error("request rejected: {0}")]
    Rejected(#[from] RegistryError),
}

/// How a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Upstream finished; `chunks` deltas were relayed
    Completed {
        /// Number of `streaming` events emitted
        chunks: usize,
    },
    /// Upstream failed at open, mid-stream or by timeout
    Failed {
        /// Message carried by the terminal event
        message: String,
    },
    /// Stopped by cancellation
    Cancelled,
}

/// The streaming multiplex gateway
pub struct Gateway<B: LlmBackend + ?Sized = dyn LlmBackend> {
    backend: Arc<B>,
    sessions: SessionRegistry,
    emitter: BroadcastEmitter,
    config: Arc<GatewayConfig>,
    tasks: TaskTracker,
}

impl<B: LlmBackend + ?Sized> Clone for Gateway<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            sessions: self.sessions.clone(),
            emitter: self.emitter.clone(),
            config: Arc::clone(&self.config),
            tasks: self.tasks.clone(),
        }
    }
}

impl<B: LlmBackend + ?Sized> std::fmt::Debug for Gateway<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("backend", &self.backend.name())
            .field("sessions", &self.sessions)
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

impl<B: LlmBackend + ?Sized + 'static> Gateway<B> {
    /// Create a gateway with its own session registry
    pub fn new(backend: Arc<B>, emitter: BroadcastEmitter, config: GatewayConfig) -> Self {
        let sessions = SessionRegistry::new(config.max_sessions);
        Self::with_registry(backend, sessions, emitter, config)
    }

    /// Create a gateway over an existing session registry
    pub fn with_registry(
        backend: Arc<B>,
        sessions: SessionRegistry,
        emitter: BroadcastEmitter,
        config: GatewayConfig,
    ) -> Self {
        Self {
            backend,
            sessions,
            emitter,
            config: Arc::new(config),
            tasks: TaskTracker::new(),
        }
    }

    /// The session registry
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// The broadcast emitter
    pub fn emitter(&self) -> &BroadcastEmitter {
        &self.emitter
    }

    /// The upstream backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Active settings
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Dispatch one inbound client event
    ///
    /// Questions start a session and return its task; relay events are
    /// broadcast as-is. A rejected question is answered to `origin` only.
    pub fn handle_event(
        &self,
        origin: Option<ConnectionId>,
        event: ClientEvent,
    ) -> Option<JoinHandle<SessionOutcome>> {
        match event {
            ClientEvent::StreamingEvent(request) => {
                let notice = (request.id.clone(), request.kind);
                match self.submit(origin, request) {
                    Ok(task) => Some(task),
                    Err(GatewayError::Rejected(reason)) => {
                        if let Some(origin) = origin {
                            let (id, kind) = notice;
                            self.emitter.notify(
                                &origin,
                                OutboundMessage::RequestRejected(RejectionNotice {
                                    id,
                                    kind,
                                    reason: reason.to_string(),
                                }),
                            );
                        }
                        None
                    }
                }
            }
            ClientEvent::TakeScreenshot => {
                self.emitter.relay(OutboundMessage::TakeScreenshot);
                None
            }
            ClientEvent::RecordingEvent(recording) => {
                self.emitter.relay(OutboundMessage::RecordingEvent(recording));
                None
            }
            ClientEvent::RecordingEventClient(recording) => {
                self.emitter
                    .relay(OutboundMessage::RecordingEventClient(recording));
                None
            }
        }
    }

    /// Admit a request and spawn its session
    ///
    /// Admission happens before this returns, so a duplicate submitted right
    /// after is rejected deterministically.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Rejected`] when the registry is full or the
    /// request's `(id, type)` is already in flight.
    pub fn submit(
        &self,
        origin: Option<ConnectionId>,
        request: Request,
    ) -> Result<JoinHandle<SessionOutcome>, GatewayError> {
        let handle = match self.sessions.create(&request, origin) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    session_id = %request.id,
                    kind = %request.kind,
                    reason = %e,
                    "Request rejected"
                );
                return Err(e.into());
            }
        };

        let span = tracing::info_span!(
            "session",
            session_id = %request.id,
            kind = %request.kind,
        );
        let gateway = self.clone();
        Ok(self.tasks.spawn(
            async move { gateway.run(handle, request).await }.instrument(span),
        ))
    }

    /// Fire-and-forget submission
    ///
    /// Results reach clients through the emitter only.
    pub fn handle(&self, request: Request) {
        if let Err(e) = self.submit(None, request) {
            tracing::debug!(error = %e, "Dropped request without an origin");
        }
    }

    /// Drive one admitted session to its terminal event
    ///
    /// Consumes the handle; the session is retired once the `end` event has
    /// been broadcast.
    pub async fn run(&self, handle: SessionHandle, request: Request) -> SessionOutcome {
        self.emitter
            .emit(StreamEvent::start(&request.id, request.kind, &request.text));

        let outcome = self.consume(&handle, &request).await;

        let terminal = match outcome {
            SessionOutcome::Completed { chunks } => {
                handle.set_state(SessionState::Completed);
                tracing::info!(chunks, "Session completed");
                StreamEvent::completed(&request.id, request.kind)
            }
            SessionOutcome::Failed { ref message } => {
                handle.set_state(SessionState::Failed);
                tracing::error!(error = %message, "Session failed");
                StreamEvent::failed(&request.id, request.kind, message)
            }
            SessionOutcome::Cancelled => {
                handle.set_state(SessionState::Cancelled);
                tracing::warn!("Session cancelled");
                StreamEvent::failed(&request.id, request.kind, CANCELLED_MESSAGE)
            }
        };
        self.emitter.emit(terminal);
        drop(handle);

        outcome
    }

    /// Cancel the sessions started by a departed connection
    ///
    /// Does nothing unless `cancel_on_disconnect` is set. Returns the number
    /// of sessions signalled.
    pub fn handle_disconnect(&self, connection: ConnectionId) -> usize {
        if !self.config.cancel_on_disconnect {
            return 0;
        }
        self.sessions.cancel_origin(connection)
    }

    /// Cancel every in-flight session
    pub fn shutdown(&self) -> usize {
        let cancelled = self.sessions.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled in-flight sessions for shutdown");
        }
        cancelled
    }

    /// Wait for session tasks to finish, giving up after `limit`
    ///
    /// Returns false if sessions were still running at the deadline. Pair
    /// with [`Gateway::shutdown`] so every session gets to emit its `end`.
    pub async fn wait_for_sessions(&self, limit: Duration) -> bool {
        self.tasks.close();
        let finished = tokio::time::timeout(limit, self.tasks.wait())
            .await
            .is_ok();
        self.tasks.reopen();
        finished
    }

    async fn consume(&self, handle: &SessionHandle, request: &Request) -> SessionOutcome {
        let cancel = handle.cancellation().clone();
        let llm_request = LlmRequest::new(
            self.config.prompt.render(request.kind, &request.text),
            self.config.model.clone(),
        )
        .with_temperature(self.config.temperature);

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return SessionOutcome::Cancelled,
            opened = self.backend.send_streaming(&llm_request) => opened,
        };
        let mut rx = match opened {
            Ok(rx) => rx,
            Err(e) => {
                return SessionOutcome::Failed {
                    message: format!("{e:#}"),
                }
            }
        };
        handle.set_state(SessionState::Streaming);
        tracing::debug!(backend = self.backend.name(), "Upstream stream opened");

        let mut chunks = 0usize;
        loop {
            let (limit, waiting_for) = if chunks == 0 {
                (self.config.first_token_timeout, "first token")
            } else {
                (self.config.idle_timeout, "next token")
            };

            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionOutcome::Cancelled,
                next = recv_within(&mut rx, limit) => next,
            };

            match next {
                Ok(Some(StreamingToken::Token(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    chunks += 1;
                    self.emitter
                        .emit(StreamEvent::streaming(&request.id, request.kind, text));
                }
                Ok(Some(StreamingToken::Complete)) => {
                    return SessionOutcome::Completed { chunks };
                }
                Ok(Some(StreamingToken::Error(message))) => {
                    return SessionOutcome::Failed { message };
                }
                Ok(None) => {
                    return SessionOutcome::Failed {
                        message: UNEXPECTED_CLOSE_MESSAGE.to_string(),
                    };
                }
                Err(limit) => {
                    return SessionOutcome::Failed {
                        message: format!(
                            "upstream timed out after {}ms waiting for {waiting_for}",
                            limit.as_millis()
                        ),
                    };
                }
            }
        }
    }
}

/// Receive the next token, giving up after `limit`
async fn recv_within(
    rx: &mut mpsc::Receiver<StreamingToken>,
    limit: Option<Duration>,
) -> Result<Option<StreamingToken>, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, rx.recv())
            .await
            .map_err(|_| limit),
        None => Ok(rx.recv().await),
    }
}
