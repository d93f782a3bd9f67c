//! Client Events
//!
//! Events sent from browser clients to the gateway. These cover the single
//! request that starts a streaming session plus a handful of control signals
//! that are relayed verbatim to every connected client.
//!
//! # Design Philosophy
//!
//! Clients are renderers. They forward what the user captured (a question
//! read off a screenshot or transcribed from audio) and the gateway decides
//! what to do with it. The gateway never inspects the question text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::session::SessionKey;

/// Where the question text came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Text extracted from a screenshot
    Screenshot,
    /// Text transcribed from an audio recording
    Audio,
}

impl RequestKind {
    /// Wire name of the kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::Audio => "audio",
        }
    }

    /// Short phrase describing how the text was obtained, used in prompts
    #[must_use]
    pub fn source_description(&self) -> &'static str {
        match self {
            Self::Screenshot => "extracted from an image",
            Self::Audio => "transcribed from an audio recording",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "screenshot" => Ok(Self::Screenshot),
            "audio" => Ok(Self::Audio),
            other => Err(format!("unknown request type: {other}")),
        }
    }
}

/// A question to answer
///
/// Immutable once received. The `id` is chosen by the client and is only
/// assumed unique among sessions that are currently in flight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// The question text
    pub text: String,
    /// Where the text came from
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Client-chosen correlation id
    pub id: String,
}

impl Request {
    /// Create a new request
    pub fn new(id: impl Into<String>, kind: RequestKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
            id: id.into(),
        }
    }

    /// Registry key for the session this request starts
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.id.clone(), self.kind)
    }
}

/// Events from a client to the gateway
///
/// On the wire each event is an envelope `{"event": <name>, "data": <payload>}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Start streaming an answer for a question
    StreamingEvent(Request),

    /// Ask every client to capture a screenshot
    TakeScreenshot,

    /// Recording state changed on the capture side
    RecordingEvent(bool),

    /// Recording state changed on a viewer client
    RecordingEventClient(bool),
}

impl ClientEvent {
    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamingEvent(_) => "streaming_event",
            Self::TakeScreenshot => "take_screenshot",
            Self::RecordingEvent(_) => "recording_event",
            Self::RecordingEventClient(_) => "recording_event_client",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_kind_parse() {
        assert_eq!("screenshot".parse::<RequestKind>(), Ok(RequestKind::Screenshot));
        assert_eq!("AUDIO".parse::<RequestKind>(), Ok(RequestKind::Audio));
        assert!("video".parse::<RequestKind>().is_err());
    }

    #[test]
    fn test_streaming_event_from_wire() {
        let json = r#"{"event":"streaming_event","data":{"text":"What is 2+2?","type":"screenshot","id":"q-1"}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();

        assert_eq!(
            event,
            ClientEvent::StreamingEvent(Request::new(
                "q-1",
                RequestKind::Screenshot,
                "What is 2+2?"
            ))
        );
        assert_eq!(event.name(), "streaming_event");
    }

    #[test]
    fn test_control_events_from_wire() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"take_screenshot"}"#).unwrap();
        assert_eq!(event, ClientEvent::TakeScreenshot);

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"recording_event","data":true}"#).unwrap();
        assert_eq!(event, ClientEvent::RecordingEvent(true));

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"recording_event_client","data":false}"#).unwrap();
        assert_eq!(event, ClientEvent::RecordingEventClient(false));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"event":"streaming_event","data":{"text":"hi","type":"video","id":"1"}}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }

    #[test]
    fn test_request_key() {
        let request = Request::new("abc", RequestKind::Audio, "question");
        let key = request.key();
        assert_eq!(key.id, "abc");
        assert_eq!(key.kind, RequestKind::Audio);
    }
}
