//! LLM Backend Integration
//!
//! This module provides abstracted access to upstream LLM providers through a
//! common trait interface.
//!
//! # Available Backends
//!
//! - **OpenAI**: OpenAI chat completions or any compatible server (default)
//! - **Scripted**: Deterministic replay for tests and offline runs
//!
//! # Usage
//!
//! ```ignore
//! use askrelay_core::backend::{OpenAiBackend, LlmBackend, LlmRequest};
//!
//! let backend = OpenAiBackend::from_env()?;
//! let request = LlmRequest::new("Hello!", "gpt-4.1-nano");
//! let rx = backend.send_streaming(&request).await?;
//! ```

mod openai;
mod scripted;
mod traits;

pub use openai::{OpenAiBackend, DEFAULT_BASE_URL, DEFAULT_MODEL};
pub use scripted::{ScriptStep, ScriptedBackend};
pub use traits::{LlmBackend, LlmRequest, StreamingToken};
