//! Frame Codec
//!
//! JSON envelopes exchanged over WebSocket text frames:
//! `{"event": <name>, "data": <payload>}`.

use thiserror::Error;

use crate::events::ClientEvent;
use crate::messages::OutboundMessage;

/// Default upper bound on an inbound frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Frame encoding/decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not a recognised envelope (bad JSON, unknown event, wrong payload)
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound frame exceeds the size limit
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Frame size
        size: usize,
        /// Configured limit
        max: usize,
    },
}

/// Encoder/decoder for envelope frames
#[derive(Clone, Copy, Debug)]
pub struct JsonCodec {
    max_frame_bytes: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl JsonCodec {
    /// Create a codec with a frame size limit
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Decode an inbound text frame
    ///
    /// # Errors
    ///
    /// Returns `CodecError::TooLarge` before parsing oversized frames, and
    /// `CodecError::Json` for anything that is not a known client event.
    pub fn decode(&self, frame: &str) -> Result<ClientEvent, CodecError> {
        if frame.len() > self.max_frame_bytes {
            return Err(CodecError::TooLarge {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
        }
        Ok(serde_json::from_str(frame)?)
    }

    /// Encode an outbound message as a text frame
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Json` if serialization fails.
    pub fn encode(&self, message: &OutboundMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Request, RequestKind};
    use crate::messages::StreamEvent;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_streaming_event() {
        let codec = JsonCodec::default();
        let event = codec
            .decode(r#"{"event":"streaming_event","data":{"text":"Why?","type":"audio","id":"7"}}"#)
            .unwrap();
        assert_eq!(
            event,
            ClientEvent::StreamingEvent(Request::new("7", RequestKind::Audio, "Why?"))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = JsonCodec::default();
        assert!(matches!(codec.decode("not json"), Err(CodecError::Json(_))));
        assert!(matches!(
            codec.decode(r#"{"event":"self_destruct"}"#),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            codec.decode(r#"{"event":"streaming_event","data":{"text":"x","type":"video","id":"1"}}"#),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let codec = JsonCodec::new(16);
        let err = codec
            .decode(r#"{"event":"recording_event","data":true}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { max: 16, .. }));
    }

    #[test]
    fn test_encode_envelope() {
        let codec = JsonCodec::default();
        let frame = codec
            .encode(&OutboundMessage::StreamResponse(StreamEvent::streaming(
                "1",
                RequestKind::Screenshot,
                "Hi",
            )))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["event"], "stream_response");
        assert_eq!(value["data"]["status"], "streaming");
        assert_eq!(value["data"]["content"], "Hi");
    }
}
