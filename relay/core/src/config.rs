//! TOML Configuration File Support
//!
//! Centralized configuration for the relay, loaded from an optional TOML file
//! at `~/.config/askrelay/config.toml` and the environment.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon after loading)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:3000"
//! max_connections = 100
//! connection_channel_capacity = 256
//! slow_client_policy = "drop_message"
//!
//! [backend]
//! kind = "openai"
//! model = "gpt-4.1-nano"
//! temperature = 0.0
//!
//! [gateway]
//! max_sessions = 64
//! cancel_on_disconnect = true
//! first_token_timeout_secs = 60
//! idle_timeout_secs = 60
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::client_registry::SlowClientPolicy;
use crate::prompt::PromptTemplate;
use crate::registry::DEFAULT_MAX_SESSIONS;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Io {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Sections
// =============================================================================

/// Which upstream implementation to run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI-compatible HTTP streaming
    #[default]
    Openai,
    /// In-process echo backend, no network
    Scripted,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Openai => write!(f, "openai"),
            Self::Scripted => write!(f, "scripted"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::Openai),
            "scripted" => Ok(Self::Scripted),
            other => Err(format!("unknown backend '{other}' (expected openai or scripted)")),
        }
    }
}

/// `[server]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address for the WebSocket server
    pub bind_address: String,
    /// Maximum simultaneous client connections
    pub max_connections: usize,
    /// Outbound queue depth per connection
    pub connection_channel_capacity: usize,
    /// What to do when a connection's queue is full
    pub slow_client_policy: SlowClientPolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3000".to_string(),
            max_connections: 100,
            connection_channel_capacity: 256,
            slow_client_policy: SlowClientPolicy::DropMessage,
        }
    }
}

/// `[backend]` section
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Upstream implementation
    pub kind: BackendKind,
    /// API credential; absence fails requests, not startup
    pub api_key: Option<String>,
    /// API base URL
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Whole-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("kind", &self.kind)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            request_timeout_secs: 120,
        }
    }
}

/// `[gateway]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Maximum in-flight sessions
    pub max_sessions: usize,
    /// Cancel a connection's sessions when it disconnects
    pub cancel_on_disconnect: bool,
    /// Limit on the wait for the first delta (0 disables)
    pub first_token_timeout_secs: u64,
    /// Limit on the gap between deltas (0 disables)
    pub idle_timeout_secs: u64,
    /// Custom prompt template; must contain `{question}`
    pub prompt_template: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            cancel_on_disconnect: true,
            first_token_timeout_secs: 60,
            idle_timeout_secs: 60,
            prompt_template: None,
        }
    }
}

/// Complete relay configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket server settings
    pub server: ServerSettings,
    /// Upstream model settings
    pub backend: BackendSettings,
    /// Orchestrator settings
    pub gateway: GatewaySettings,
    /// File the configuration was read from, if any
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

impl RelayConfig {
    /// Parse a TOML document over the defaults
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML or unknown enum values.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override values from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Override values from an arbitrary variable lookup
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparsable environment value");
                    None
                }
            }
        }

        // Server
        if let Some(addr) = lookup("ASKRELAY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Some(n) = parsed("ASKRELAY_MAX_CONNECTIONS", lookup("ASKRELAY_MAX_CONNECTIONS")) {
            self.server.max_connections = n;
        }
        if let Some(n) = parsed("ASKRELAY_CHANNEL_CAPACITY", lookup("ASKRELAY_CHANNEL_CAPACITY")) {
            self.server.connection_channel_capacity = n;
        }
        if let Some(policy) = lookup("ASKRELAY_SLOW_CLIENT_POLICY") {
            match policy.trim().to_ascii_lowercase().as_str() {
                "drop_message" => self.server.slow_client_policy = SlowClientPolicy::DropMessage,
                "disconnect" => self.server.slow_client_policy = SlowClientPolicy::Disconnect,
                _ => tracing::warn!(
                    value = %policy,
                    "Ignoring unknown ASKRELAY_SLOW_CLIENT_POLICY"
                ),
            }
        }

        // Backend
        if let Some(kind) = parsed("ASKRELAY_BACKEND", lookup("ASKRELAY_BACKEND")) {
            self.backend.kind = kind;
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.backend.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(model) = lookup("ASKRELAY_MODEL") {
            self.backend.model = model;
        }
        if let Some(t) = parsed("ASKRELAY_TEMPERATURE", lookup("ASKRELAY_TEMPERATURE")) {
            self.backend.temperature = t;
        }

        // Gateway
        if let Some(n) = parsed("ASKRELAY_MAX_SESSIONS", lookup("ASKRELAY_MAX_SESSIONS")) {
            self.gateway.max_sessions = n;
        }
        if let Some(flag) = lookup("ASKRELAY_CANCEL_ON_DISCONNECT") {
            self.gateway.cancel_on_disconnect = flag != "0" && flag.to_lowercase() != "false";
        }
        if let Some(secs) = parsed(
            "ASKRELAY_FIRST_TOKEN_TIMEOUT",
            lookup("ASKRELAY_FIRST_TOKEN_TIMEOUT"),
        ) {
            self.gateway.first_token_timeout_secs = secs;
        }
        if let Some(secs) = parsed("ASKRELAY_IDLE_TIMEOUT", lookup("ASKRELAY_IDLE_TIMEOUT")) {
            self.gateway.idle_timeout_secs = secs;
        }
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.bind_address '{}' is not a socket address",
                self.server.bind_address
            )));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be greater than 0".to_string(),
            ));
        }
        if self.server.connection_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.connection_channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.gateway.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "gateway.max_sessions must be greater than 0".to_string(),
            ));
        }
        if self.backend.model.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            return Err(ConfigError::Invalid(
                "backend.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        self.prompt_template().map(|_| ())
    }

    /// The configured prompt template, or the built-in one
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the custom template lacks `{question}`.
    pub fn prompt_template(&self) -> Result<PromptTemplate, ConfigError> {
        match self.gateway.prompt_template {
            Some(ref template) => PromptTemplate::new(template.clone()),
            None => Ok(PromptTemplate::default()),
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/askrelay/config.toml` or the platform equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("askrelay").join("config.toml"))
}

/// Load configuration from the file and the process environment
///
/// An explicit `path` must exist. Without one, the default path is used if
/// present and defaults otherwise. The result is not validated; callers apply
/// CLI overrides first and then call [`RelayConfig::validate`].
///
/// # Errors
///
/// Returns an error if a config file cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with an injectable environment
///
/// # Errors
///
/// Returns an error if a config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<&Path>, lookup: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let candidate = match path {
        Some(explicit) => Some(explicit.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    let mut config = match candidate {
        Some(config_path) => {
            let content =
                std::fs::read_to_string(&config_path).map_err(|e| ConfigError::Io {
                    path: config_path.clone(),
                    source: e,
                })?;
            let mut config = RelayConfig::from_toml_str(&content)?;
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            config.loaded_from = Some(config_path);
            config
        }
        None => {
            tracing::debug!("No config file found, using defaults");
            RelayConfig::default()
        }
    };

    config.apply_env_from(lookup);
    Ok(config)
}
