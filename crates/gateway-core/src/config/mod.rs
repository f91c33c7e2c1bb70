//! Gateway configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded once at process start, in this order (later
//! overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in `Default` implementations
//! 2. **Config file**: TOML file named by the `GATEWAY_CONFIG` env var
//! 3. **Environment variables**: `GATEWAY_*` overrides for specific fields
//!
//! # Sections
//!
//! - [`PocketConfig`]: service-node network client parameters (dispatchers,
//!   timeouts, consensus settings)
//! - [`RelaySettings`]: dispatcher loop behavior (attempts, payload cap,
//!   probe and fallback timeouts)
//! - [`ServerConfig`] / [`LoggingConfig`]: ingress and log wiring consumed
//!   by the server binary
//!
//! The loaded [`GatewayConfig`] is immutable; request-scoped parameters are
//! derived from it by the [`tuner`] instead of mutating shared state.

pub mod tuner;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Parameters of the external service-node network client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PocketConfig {
    /// Dispatcher URLs used to negotiate sessions. Cannot be empty outside
    /// of tests.
    #[serde(default)]
    pub dispatchers: Vec<String>,

    /// Maximum concurrently tracked sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Node count for consensus-mode relays. Defaults to `5`.
    #[serde(default = "default_consensus_node_count")]
    pub consensus_node_count: usize,

    /// Per-relay dispatch timeout in milliseconds. Defaults to `20000`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Whether disputed consensus responses are accepted. Defaults to `true`
    /// for client relays; the sync-checker's challenge relay always runs
    /// with this off.
    #[serde(default = "default_accept_disputed_responses")]
    pub accept_disputed_responses: bool,

    /// Blocks per session rollover, as defined by the network.
    #[serde(default = "default_session_block_frequency")]
    pub session_block_frequency: u64,

    /// Expected block time in milliseconds.
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,

    /// Session refresh attempts after a "session expired" relay error.
    #[serde(default = "default_max_session_refresh_retries")]
    pub max_session_refresh_retries: u32,

    /// Whether relay response signatures are validated by the sender.
    #[serde(default = "default_validate_relay_responses")]
    pub validate_relay_responses: bool,

    #[serde(default)]
    pub reject_self_signed_certificates: bool,
}

fn default_max_sessions() -> usize {
    1000
}
fn default_consensus_node_count() -> usize {
    5
}
fn default_request_timeout_ms() -> u64 {
    20_000
}
fn default_accept_disputed_responses() -> bool {
    true
}
fn default_session_block_frequency() -> u64 {
    4
}
fn default_block_time_ms() -> u64 {
    1_038_000
}
fn default_max_session_refresh_retries() -> u32 {
    1
}
fn default_validate_relay_responses() -> bool {
    true
}

impl Default for PocketConfig {
    fn default() -> Self {
        Self {
            dispatchers: Vec::new(),
            max_sessions: default_max_sessions(),
            consensus_node_count: default_consensus_node_count(),
            request_timeout_ms: default_request_timeout_ms(),
            accept_disputed_responses: default_accept_disputed_responses(),
            session_block_frequency: default_session_block_frequency(),
            block_time_ms: default_block_time_ms(),
            max_session_refresh_retries: default_max_session_refresh_retries(),
            validate_relay_responses: default_validate_relay_responses(),
            reject_self_signed_certificates: false,
        }
    }
}

/// Dispatcher loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Relay attempts before giving up and trying the fallback. Defaults to
    /// `5`.
    #[serde(default = "default_max_relay_attempts")]
    pub max_relay_attempts: u32,

    /// Maximum accepted JSON-RPC payload size in bytes. Defaults to `102400`.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Timeout for sync/chain check probes in milliseconds. Defaults to
    /// `5000`.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Timeout for the alt-runtime fallback POST in milliseconds. Defaults
    /// to `10000`.
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
}

fn default_max_relay_attempts() -> u32 {
    5
}
fn default_max_payload_bytes() -> usize {
    102_400
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_fallback_timeout_ms() -> u64 {
    10_000
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_relay_attempts: default_max_relay_attempts(),
            max_payload_bytes: default_max_payload_bytes(),
            probe_timeout_ms: default_probe_timeout_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

/// HTTP ingress settings, consumed by the server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_bind_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), bind_port: default_bind_port() }
    }
}

/// Log level and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "trace" | "debug" | "info" | "warn" | "error". Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "json" or "pretty". Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Process-wide configuration, read once at start and passed around by
/// immutable reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway-wide secret compared against per-application secrets.
    #[serde(default)]
    pub secret_key: String,

    /// Key for decrypting stored credentials; owned by the external stores.
    #[serde(default)]
    pub database_encryption_key: String,

    /// Stable identifier of this gateway process in metrics rows.
    #[serde(default)]
    pub process_uid: String,

    /// Postgres URL for the registry repositories and the relay metrics
    /// table.
    #[serde(default)]
    pub database_url: String,

    /// Cache backend URL. Empty selects the in-process backend.
    #[serde(default)]
    pub cache_url: String,

    #[serde(default)]
    pub pocket: PocketConfig,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Loads configuration from defaults, the optional `GATEWAY_CONFIG` TOML
    /// file, and `GATEWAY_*` environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError` when a source fails to parse or validation
    /// rejects the merged result.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
            builder = builder.add_source(File::with_name(&path));
        }

        let merged = builder
            .add_source(Environment::with_prefix("GATEWAY").separator("__"))
            .build()?;

        let config: Self = merged.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the merged configuration; invalid settings fail startup
    /// rather than surfacing mid-relay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.max_relay_attempts == 0 {
            return Err(ConfigError::Message("max_relay_attempts must be at least 1".into()));
        }
        if self.relay.max_payload_bytes == 0 {
            return Err(ConfigError::Message("max_payload_bytes must be positive".into()));
        }
        if self.pocket.request_timeout_ms == 0 {
            return Err(ConfigError::Message("request_timeout_ms must be positive".into()));
        }
        if self.pocket.consensus_node_count == 0 {
            return Err(ConfigError::Message("consensus_node_count must be positive".into()));
        }
        if self.server.bind_port == 0 {
            return Err(ConfigError::Message("bind_port must be greater than 0".into()));
        }
        Ok(())
    }
}
