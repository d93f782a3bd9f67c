//! LLM Backend Traits
//!
//! Trait definitions for upstream LLM backends. The gateway treats a backend
//! as an opaque, possibly-failing producer of text deltas; everything
//! provider-specific (API format, auth, transport) lives in implementations.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Token stream events from LLM backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A text delta from the response
    Token(String),
    /// Response completed successfully
    Complete,
    /// Error occurred during streaming; no further tokens follow
    Error(String),
}

/// Configuration for LLM requests
#[derive(Clone, Debug)]
pub struct LlmRequest {
    /// The prompt to send
    pub prompt: String,
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// Temperature (0.0-2.0)
    pub temperature: f32,
    /// Maximum tokens in response (0 = provider default)
    pub max_tokens: u32,
    /// System prompt (optional)
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: String::new(),
            temperature: 0.0,
            max_tokens: 0,
            system: None,
        }
    }
}

impl LlmRequest {
    /// Create a new request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// LLM Backend trait
///
/// Implement this trait to add support for different LLM providers.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Get the backend name (e.g., "OpenAI")
    fn name(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Send a request and get a streaming response
    ///
    /// An `Err` is an open-time failure (bad credentials, unreachable
    /// provider, rejected request). Once open, the receiver yields tokens
    /// and ends with exactly one `Complete` or `Error`. Dropping the
    /// receiver stops the producer.
    async fn send_streaming(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_request_builder() {
        let request = LlmRequest::new("Hello", "gpt-4.1-nano")
            .with_temperature(0.5)
            .with_system("You are helpful")
            .with_max_tokens(100);

        assert_eq!(request.prompt, "Hello");
        assert_eq!(request.model, "gpt-4.1-nano");
        assert!((request.temperature - 0.5).abs() < f32::EPSILON);
        assert_eq!(request.system, Some("You are helpful".to_string()));
        assert_eq!(request.max_tokens, 100);
    }

    #[test]
    fn test_temperature_is_clamped() {
        let request = LlmRequest::new("x", "m").with_temperature(7.0);
        assert!((request.temperature - 2.0).abs() < f32::EPSILON);

        let request = LlmRequest::new("x", "m").with_temperature(-1.0);
        assert!(request.temperature.abs() < f32::EPSILON);
    }
}
