//! askrelay Daemon - Streaming Gateway Server
//!
//! Hosts the askrelay gateway behind a WebSocket listener. Capture pages send
//! questions, every connected client receives the streamed answers.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:3000, OpenAI backend)
//! OPENAI_API_KEY=sk-... askrelay-daemon
//!
//! # Custom address and config file
//! askrelay-daemon --bind 0.0.0.0:3000 --config /etc/askrelay/config.toml
//!
//! # Offline mode: echo questions back without calling a provider
//! askrelay-daemon --backend scripted
//!
//! # Verbose, machine-readable logging
//! RUST_LOG=debug askrelay-daemon --log-json
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use askrelay_core::{
    load_config, BackendKind, BroadcastEmitter, ClientRegistry, Gateway, GatewayConfig,
    LlmBackend, OpenAiBackend, RelayConfig, ScriptedBackend,
};

use server::{DaemonServer, ServerConfig};

/// askrelay Daemon - streams LLM answers to every connected client
#[derive(Parser, Debug)]
#[command(name = "askrelay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ASKRELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides server.bind_address)
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<String>,

    /// Upstream backend: openai or scripted
    #[arg(long, value_name = "KIND")]
    backend: Option<BackendKind>,

    /// Upstream model identifier
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// Maximum in-flight sessions
    #[arg(long, value_name = "N")]
    max_sessions: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Apply CLI overrides on top of file and environment values
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(ref bind) = self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(ref model) = self.model {
            config.backend.model = model.clone();
        }
        if let Some(max) = self.max_sessions {
            config.gateway.max_sessions = max;
        }
    }
}

/// Initialize logging
fn init_logging(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("askrelay_daemon=info,askrelay_core=info")
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

/// Build the configured upstream backend
fn build_backend(config: &RelayConfig) -> Result<Arc<dyn LlmBackend>> {
    let backend: Arc<dyn LlmBackend> = match config.backend.kind {
        BackendKind::Openai => {
            let backend = OpenAiBackend::from_settings(&config.backend)
                .context("Failed to create OpenAI backend")?;
            if !backend.has_api_key() {
                warn!("No API key configured; requests will fail until OPENAI_API_KEY is set");
            }
            Arc::new(backend)
        }
        BackendKind::Scripted => Arc::new(ScriptedBackend::echo(Duration::from_millis(50))),
    };
    Ok(backend)
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only SIGINT is handled");
                let _ = signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }

    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(args.log_json)?;

    info!("askrelay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        load_config(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;

    if let Some(ref path) = config.loaded_from {
        info!(config_path = ?path, "Config file");
    }
    info!(
        backend = %config.backend.kind,
        model = %config.backend.model,
        max_sessions = config.gateway.max_sessions,
        "Gateway configured"
    );

    let backend = build_backend(&config)?;
    let clients = ClientRegistry::with_policy(config.server.slow_client_policy);
    let gateway = Gateway::new(
        backend,
        BroadcastEmitter::new(clients),
        GatewayConfig::from_config(&config)?,
    );

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind_address))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let server = DaemonServer::new(gateway, ServerConfig::from_settings(&config.server));
    server.run(listener, shutdown).await?;

    info!("askrelay daemon stopped");
    Ok(())
}
