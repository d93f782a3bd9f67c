//! askrelay Core - Streaming Multiplex Gateway
//!
//! This crate relays questions (text extracted from screenshots or
//! transcribed from audio) to an upstream LLM and streams the answer back,
//! token by token, to every connected client. Any number of questions may be
//! in flight at once; each one's events stay in order.
//!
//! It is transport-agnostic: the daemon crate owns sockets, this crate owns
//! sessions, streaming and fan-out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Clients                                │
//! │   capture page        viewer        viewer        ...            │
//! │        │                 ▲             ▲                         │
//! │   ClientEvent (up)   OutboundMessage (down, per-client queue)    │
//! └────────┼─────────────────┼─────────────┼─────────────────────────┘
//!          │                 │             │
//! ┌────────┼─────────────────┼─────────────┼─────────────────────────┐
//! │        ▼             ASKRELAY CORE     │                         │
//! │  ┌───────────┐   ┌────────────────┐   ┌──────────────────┐       │
//! │  │  Gateway  │──►│ BroadcastEmitter│──►│  ClientRegistry  │       │
//! │  └─────┬─────┘   └────────────────┘   └──────────────────┘       │
//! │        │                                                         │
//! │  ┌─────┴──────────┐   ┌─────────────────────────────────┐        │
//! │  │SessionRegistry │   │ LlmBackend (OpenAI / Scripted)  │        │
//! │  └────────────────┘   └─────────────────────────────────┘        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: admits requests and drives one upstream stream per session
//! - [`SessionRegistry`]: bounded, concurrent map of in-flight sessions
//! - [`BroadcastEmitter`]: fan-out of lifecycle events
//! - [`ClientRegistry`]: connected clients and their outbound queues
//! - [`StreamEvent`]: `start` / `streaming` / `end` lifecycle events
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use askrelay_core::{
//!     backend::ScriptedBackend, BroadcastEmitter, ClientRegistry, Gateway, GatewayConfig,
//!     Request, RequestKind,
//! };
//!
//! let clients = ClientRegistry::new();
//! let gateway = Gateway::new(
//!     Arc::new(ScriptedBackend::tokens(["Hello", " world"])),
//!     BroadcastEmitter::new(clients.clone()),
//!     GatewayConfig::default(),
//! );
//!
//! let task = gateway.submit(None, Request::new("1", RequestKind::Screenshot, "Hi?"))?;
//! let outcome = task.await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: upstream LLM abstraction (OpenAI-compatible, scripted)
//! - [`client_registry`]: connected clients, bounded queues, slow-client policy
//! - [`codec`]: JSON envelope framing
//! - [`config`]: TOML and environment configuration
//! - [`emitter`]: broadcast of outbound messages
//! - [`events`]: client to gateway events
//! - [`gateway`]: the stream orchestrator
//! - [`messages`]: gateway to client messages and the stream event wire form
//! - [`prompt`]: prompt template
//! - [`registry`]: in-flight session registry
//! - [`session`]: session record and lifecycle

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod client_registry;
pub mod codec;
pub mod config;
pub mod emitter;
pub mod events;
pub mod gateway;
pub mod messages;
pub mod prompt;
pub mod registry;
pub mod session;

// Re-exports for convenience
pub use backend::{LlmBackend, LlmRequest, OpenAiBackend, ScriptedBackend, StreamingToken};
pub use client_registry::{
    BroadcastResult, ClientHandle, ClientRegistry, ConnectionId, SlowClientPolicy,
};
pub use codec::{CodecError, JsonCodec};
pub use config::{
    default_config_path, load_config, BackendKind, ConfigError, RelayConfig,
};
pub use emitter::{BroadcastEmitter, EmitterStats};
pub use events::{ClientEvent, Request, RequestKind};
pub use gateway::{Gateway, GatewayConfig, GatewayError, SessionOutcome};
pub use messages::{EndOutcome, OutboundMessage, RejectionNotice, StreamEvent, StreamStatus};
pub use prompt::PromptTemplate;
pub use registry::{RegistryError, SessionHandle, SessionRegistry};
pub use session::{Session, SessionKey, SessionState};
