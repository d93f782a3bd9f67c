//! OpenAI-Compatible Backend Implementation
//!
//! LLM backend for the OpenAI chat completions API and compatible servers.
//!
//! # API
//!
//! - `POST {base_url}/chat/completions` with `"stream": true` returns
//!   server-sent events; each `data:` line carries a JSON chunk whose
//!   `choices[0].delta.content` is the next text delta. The stream ends with
//!   `data: [DONE]`.
//! - `GET {base_url}/models` is used as a health probe.
//!
//! A missing API key is not a construction error. It surfaces as an
//! open-time failure on the first request so the daemon can start without
//! credentials.

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::traits::{LlmBackend, LlmRequest, StreamingToken};
use crate::config::BackendSettings;

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// OpenAI-compatible backend client
#[derive(Clone)]
pub struct OpenAiBackend {
    /// Bearer credential; `None` fails every request at open time
    api_key: Option<String>,
    /// Base URL without trailing slash
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl OpenAiBackend {
    /// Create a backend with the default request timeout (120s)
    ///
    /// # Errors
    ///
    /// Fails only if the HTTP client cannot be built.
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_timeout(api_key, base_url, Duration::from_secs(120))
    }

    /// Create a backend with an explicit whole-request timeout
    ///
    /// # Errors
    ///
    /// Fails only if the HTTP client cannot be built.
    pub fn with_timeout(
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Create from the `[backend]` configuration section
    ///
    /// # Errors
    ///
    /// Fails only if the HTTP client cannot be built.
    pub fn from_settings(settings: &BackendSettings) -> anyhow::Result<Self> {
        Self::with_timeout(
            settings.api_key.clone(),
            settings.base_url.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    /// Create from `OPENAI_API_KEY` / `OPENAI_BASE_URL`
    ///
    /// # Errors
    ///
    /// Fails only if the HTTP client cannot be built.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(api_key, base_url)
    }

    /// Whether a credential is configured
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    /// Build the chat completions request body
    fn build_body(request: &LlmRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "temperature": request.temperature,
        });
        if request.max_tokens > 0 {
            body["max_tokens"] = json!(request.max_tokens);
        }
        body
    }
}

/// One parsed line of the SSE body
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    /// A JSON chunk; `delta` is absent for role-only or empty chunks
    Data { delta: Option<String>, finished: bool },
    /// `data: [DONE]`
    Done,
    /// An in-band error object
    Error(String),
    /// Comments, blank lines, other fields, unparsable data
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(value) = serde_json::from_str::<Value>(data) else {
        tracing::debug!(line = data, "Skipping unparsable SSE chunk");
        return SseLine::Skip;
    };

    if let Some(error) = value.get("error") {
        return SseLine::Error(error_message(error));
    }

    let choice = value.pointer("/choices/0");
    let delta = choice
        .and_then(|c| c.pointer("/delta/content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);
    let finished = choice
        .and_then(|c| c.get("finish_reason"))
        .is_some_and(|r| !r.is_null());

    SseLine::Data { delta, finished }
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| error.to_string(), String::from)
}

/// Describe a non-2xx response, preferring the provider's own message
fn describe_http_error(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").map(error_message))
        .unwrap_or_else(|| body.trim().to_string());

    if detail.is_empty() {
        format!("upstream returned {status}")
    } else {
        format!("upstream returned {status}: {detail}")
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "OpenAI"
    }

    async fn health_check(&self) -> bool {
        let mut request = self
            .http_client
            .get(self.models_url())
            .timeout(Duration::from_secs(5));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn send_streaming(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("missing API key: set backend.api_key or OPENAI_API_KEY"))?;

        let response = self
            .http_client
            .post(self.chat_url())
            .bearer_auth(api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(describe_http_error(status, &body));
        }

        let (tx, rx) = mpsc::channel(100);
        let mut stream = response.bytes_stream();

        // Spawn task to process stream
        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            let mut finished = false;

            // Returns true once the stream reached a terminal token
            async fn dispatch(
                line: &str,
                tx: &mpsc::Sender<StreamingToken>,
                finished: &mut bool,
            ) -> Option<bool> {
                match parse_sse_line(line) {
                    SseLine::Data { delta, finished: f } => {
                        *finished |= f;
                        if let Some(text) = delta {
                            // Receiver dropped: the session is gone
                            tx.send(StreamingToken::Token(text)).await.ok()?;
                        }
                        Some(false)
                    }
                    SseLine::Done => {
                        let _ = tx.send(StreamingToken::Complete).await;
                        Some(true)
                    }
                    SseLine::Error(message) => {
                        let _ = tx.send(StreamingToken::Error(message)).await;
                        Some(true)
                    }
                    SseLine::Skip => Some(false),
                }
            }

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        pending.extend_from_slice(&bytes);
                        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                            let raw: Vec<u8> = pending.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&raw);
                            match dispatch(&line, &tx, &mut finished).await {
                                Some(false) => {}
                                Some(true) | None => return,
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                }
            }

            if !pending.is_empty() {
                let line = String::from_utf8_lossy(&pending).into_owned();
                match dispatch(&line, &tx, &mut finished).await {
                    Some(false) => {}
                    Some(true) | None => return,
                }
            }

            // Body closed without [DONE]
            let token = if finished {
                StreamingToken::Complete
            } else {
                StreamingToken::Error("upstream stream ended before completion".to_string())
            };
            let _ = tx.send(token).await;
        });

        Ok(rx)
    }
}
