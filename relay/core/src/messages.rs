//! Gateway Messages
//!
//! Messages sent from the gateway to clients. The interesting one is
//! [`StreamEvent`], the lifecycle-tagged chunk of an answer; the remaining
//! [`OutboundMessage`] variants are control signals relayed between clients.
//!
//! # Wire Format
//!
//! Every message travels as `{"event": <name>, "data": <payload>}`. Stream
//! events use the flat payload browser clients already understand:
//!
//! ```text
//! start      { status, id, type, isError:false, question, createdAt }
//! streaming  { status, id, type, isError:false, content, date }
//! end (ok)   { status, id, type, isError:false, date }
//! end (err)  { status, id, type, isError:true,  content, date }
//! ```
//!
//! In Rust the event is a closed enum with per-variant fields; the flat shape
//! only exists in the private `WireStreamEvent` adapter.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::RequestKind;

/// Lifecycle status of a stream event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Session begun
    Start,
    /// One text delta
    Streaming,
    /// Session finished (successfully or not)
    End,
}

/// How a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndOutcome {
    /// Upstream finished normally
    Success,
    /// Upstream failed, timed out or the session was cancelled
    Failure {
        /// Human-readable error message shown to clients
        message: String,
    },
}

/// One lifecycle event of a streaming session
///
/// For a given session the gateway emits exactly one `Start`, zero or more
/// `Streaming` and exactly one `End`, in that order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireStreamEvent", try_from = "WireStreamEvent")]
pub enum StreamEvent {
    /// Session begun; clients should prepare a slot for `id`
    Start {
        /// Request id
        id: String,
        /// Request kind
        kind: RequestKind,
        /// The question being answered
        question: String,
        /// When the session was created
        created_at: DateTime<Utc>,
    },
    /// One upstream text delta
    Streaming {
        /// Request id
        id: String,
        /// Request kind
        kind: RequestKind,
        /// The delta text
        content: String,
        /// When the delta was relayed
        date: DateTime<Utc>,
    },
    /// Terminal event
    End {
        /// Request id
        id: String,
        /// Request kind
        kind: RequestKind,
        /// Success or failure
        outcome: EndOutcome,
        /// When the session ended
        date: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// Create a `Start` event stamped now
    pub fn start(id: impl Into<String>, kind: RequestKind, question: impl Into<String>) -> Self {
        Self::Start {
            id: id.into(),
            kind,
            question: question.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a `Streaming` event stamped now
    pub fn streaming(id: impl Into<String>, kind: RequestKind, content: impl Into<String>) -> Self {
        Self::Streaming {
            id: id.into(),
            kind,
            content: content.into(),
            date: Utc::now(),
        }
    }

    /// Create a successful `End` event stamped now
    pub fn completed(id: impl Into<String>, kind: RequestKind) -> Self {
        Self::End {
            id: id.into(),
            kind,
            outcome: EndOutcome::Success,
            date: Utc::now(),
        }
    }

    /// Create a failed `End` event stamped now
    pub fn failed(id: impl Into<String>, kind: RequestKind, message: impl Into<String>) -> Self {
        Self::End {
            id: id.into(),
            kind,
            outcome: EndOutcome::Failure {
                message: message.into(),
            },
            date: Utc::now(),
        }
    }

    /// Lifecycle status
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        match self {
            Self::Start { .. } => StreamStatus::Start,
            Self::Streaming { .. } => StreamStatus::Streaming,
            Self::End { .. } => StreamStatus::End,
        }
    }

    /// Request id this event belongs to
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Start { id, .. } | Self::Streaming { id, .. } | Self::End { id, .. } => id,
        }
    }

    /// Request kind this event belongs to
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Start { kind, .. } | Self::Streaming { kind, .. } | Self::End { kind, .. } => {
                *kind
            }
        }
    }

    /// Whether this event reports a failure
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::End {
                outcome: EndOutcome::Failure { .. },
                ..
            }
        )
    }

    /// Whether this is the session's terminal event
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. })
    }

    /// Text carried by the event (delta text or error message)
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Streaming { content, .. } => Some(content),
            Self::End {
                outcome: EndOutcome::Failure { message },
                ..
            } => Some(message),
            _ => None,
        }
    }
}

/// Error converting a flat wire payload back into a [`StreamEvent`]
#[derive(Debug, Error)]
pub enum WireError {
    /// A field required by the status is absent
    #[error("`{status:?}` event is missing `{field}`")]
    MissingField {
        /// Status of the event
        status: StreamStatus,
        /// Name of the missing field
        field: &'static str,
    },
    /// A timestamp is not RFC 3339
    #[error("invalid timestamp `{value}`: {source}")]
    Timestamp {
        /// The offending value
        value: String,
        /// Parse failure
        source: chrono::ParseError,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStreamEvent {
    status: StreamStatus,
    id: String,
    #[serde(rename = "type")]
    kind: RequestKind,
    is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<String>,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(
    value: Option<String>,
    status: StreamStatus,
    field: &'static str,
) -> Result<DateTime<Utc>, WireError> {
    let value = value.ok_or(WireError::MissingField { status, field })?;
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| WireError::Timestamp { value, source })
}

impl From<StreamEvent> for WireStreamEvent {
    fn from(event: StreamEvent) -> Self {
        let status = event.status();
        let is_error = event.is_error();
        match event {
            StreamEvent::Start {
                id,
                kind,
                question,
                created_at,
            } => Self {
                status,
                id,
                kind,
                is_error,
                content: None,
                question: Some(question),
                created_at: Some(format_timestamp(&created_at)),
                date: None,
            },
            StreamEvent::Streaming {
                id,
                kind,
                content,
                date,
            } => Self {
                status,
                id,
                kind,
                is_error,
                content: Some(content),
                question: None,
                created_at: None,
                date: Some(format_timestamp(&date)),
            },
            StreamEvent::End {
                id,
                kind,
                outcome,
                date,
            } => Self {
                status,
                id,
                kind,
                is_error,
                content: match outcome {
                    EndOutcome::Success => None,
                    EndOutcome::Failure { message } => Some(message),
                },
                question: None,
                created_at: None,
                date: Some(format_timestamp(&date)),
            },
        }
    }
}

impl TryFrom<WireStreamEvent> for StreamEvent {
    type Error = WireError;

    fn try_from(wire: WireStreamEvent) -> Result<Self, Self::Error> {
        let status = wire.status;
        match status {
            StreamStatus::Start => Ok(Self::Start {
                id: wire.id,
                kind: wire.kind,
                question: wire.question.unwrap_or_default(),
                created_at: parse_timestamp(wire.created_at, status, "createdAt")?,
            }),
            StreamStatus::Streaming => Ok(Self::Streaming {
                id: wire.id,
                kind: wire.kind,
                content: wire.content.ok_or(WireError::MissingField {
                    status,
                    field: "content",
                })?,
                date: parse_timestamp(wire.date, status, "date")?,
            }),
            StreamStatus::End => {
                let outcome = if wire.is_error {
                    EndOutcome::Failure {
                        message: wire.content.unwrap_or_default(),
                    }
                } else {
                    EndOutcome::Success
                };
                Ok(Self::End {
                    id: wire.id,
                    kind: wire.kind,
                    outcome,
                    date: parse_timestamp(wire.date, status, "date")?,
                })
            }
        }
    }
}

/// Why a request was turned away before a session was created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionNotice {
    /// Request id
    pub id: String,
    /// Request kind
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Human-readable reason
    pub reason: String,
}

/// Messages from the gateway to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A lifecycle event of a streaming session (broadcast)
    StreamResponse(StreamEvent),

    /// Capture a screenshot (broadcast)
    TakeScreenshot,

    /// Recording state relay (broadcast)
    RecordingEvent(bool),

    /// Viewer recording state relay (broadcast)
    RecordingEventClient(bool),

    /// A request was not admitted (sent to the originator only)
    RequestRejected(RejectionNotice),
}

impl OutboundMessage {
    /// Wire name of the message
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamResponse(_) => "stream_response",
            Self::TakeScreenshot => "take_screenshot",
            Self::RecordingEvent(_) => "recording_event",
            Self::RecordingEventClient(_) => "recording_event_client",
            Self::RequestRejected(_) => "request_rejected",
        }
    }

    /// The stream event carried by this message, if any
    #[must_use]
    pub fn as_stream_event(&self) -> Option<&StreamEvent> {
        match self {
            Self::StreamResponse(event) => Some(event),
            _ => None,
        }
    }
}
