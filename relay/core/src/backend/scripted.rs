//! Scripted Backend
//!
//! A deterministic in-process backend. It replays a fixed sequence of steps
//! (tokens, delays, failures) and is what the test suites and the daemon's
//! `--backend scripted` mode run against. No network is involved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::{LlmBackend, LlmRequest, StreamingToken};

/// One step of a script
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptStep {
    /// Emit a text delta
    Token(String),
    /// Sleep before the next step
    Delay(Duration),
    /// Emit an error and stop
    Fail(String),
    /// Produce nothing until the consumer goes away
    Hang,
}

#[derive(Clone, Debug)]
enum Mode {
    /// Replay the same steps for every request
    Script(Vec<ScriptStep>),
    /// Echo the prompt back word by word
    Echo { delay: Duration },
}

/// Deterministic backend driven by a script
#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    mode: Mode,
    open_error: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Create a backend replaying `steps`, followed by completion unless a
    /// step fails or hangs
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            mode: Mode::Script(steps),
            open_error: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stream each string as one delta, then complete
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            tokens
                .into_iter()
                .map(|t| ScriptStep::Token(t.into()))
                .collect(),
        )
    }

    /// Stream `tokens`, then fail with `message`
    pub fn failing_after<I, S>(tokens: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps: Vec<ScriptStep> = tokens
            .into_iter()
            .map(|t| ScriptStep::Token(t.into()))
            .collect();
        steps.push(ScriptStep::Fail(message.into()));
        Self::new(steps)
    }

    /// Refuse every request at open time
    #[must_use]
    pub fn failing_on_open(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            ..Self::new(Vec::new())
        }
    }

    /// Echo the prompt back one word at a time
    #[must_use]
    pub fn echo(delay: Duration) -> Self {
        Self {
            mode: Mode::Echo { delay },
            open_error: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Insert a delay between every step
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        if let Mode::Script(ref mut steps) = self.mode {
            *steps = steps
                .drain(..)
                .flat_map(|s| [ScriptStep::Delay(delay), s])
                .collect();
        }
        self
    }

    /// Number of `send_streaming` calls seen, including refused ones
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn steps_for(&self, request: &LlmRequest) -> Vec<ScriptStep> {
        match self.mode {
            Mode::Script(ref steps) => steps.clone(),
            Mode::Echo { delay } => {
                // The question of the rendered prompt, or the whole prompt
                let question = request
                    .prompt
                    .split_once("Question:")
                    .map_or(request.prompt.as_str(), |(_, rest)| {
                        rest.rsplit_once("\n\nAnswer").map_or(rest, |(q, _)| q)
                    })
                    .trim();
                let mut steps = Vec::new();
                for (i, word) in question.split_whitespace().enumerate() {
                    if !delay.is_zero() {
                        steps.push(ScriptStep::Delay(delay));
                    }
                    let text = if i == 0 {
                        word.to_string()
                    } else {
                        format!(" {word}")
                    };
                    steps.push(ScriptStep::Token(text));
                }
                steps
            }
        }
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        self.open_error.is_none()
    }

    async fn send_streaming(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(ref message) = self.open_error {
            anyhow::bail!("{message}");
        }

        let steps = self.steps_for(request);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Token(text) => {
                        if tx.send(StreamingToken::Token(text)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                    ScriptStep::Fail(message) => {
                        let _ = tx.send(StreamingToken::Error(message)).await;
                        return;
                    }
                    ScriptStep::Hang => {
                        tx.closed().await;
                        return;
                    }
                }
            }
            let _ = tx.send(StreamingToken::Complete).await;
        });

        Ok(rx)
    }
}
