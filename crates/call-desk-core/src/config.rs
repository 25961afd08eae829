//! Client configuration, loaded from `call-desk.toml` plus `CALL_DESK_*`
//! environment overrides.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "call-desk.toml";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeskConfig {
    pub connection: ConnectionConfig,
    pub agent: AgentConfig,
    pub ai_service: AiServiceConfig,
    pub storage: StorageConfig,
}

/// Backend connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Scheme and host of the gateway, without port, e.g. `ws://localhost`.
    pub base_url: String,
    /// Path of the call-center socket endpoint.
    pub call_center_path: String,
    /// Value of the `role` query parameter.
    pub role: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// Close a socket that has been silent this long. Off when unset.
    pub heartbeat_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost".to_string(),
            call_center_path: "/ws/call-center".to_string(),
            role: "agent".to_string(),
            reconnect_base_ms: 3_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: None,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub const fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_ms.map(Duration::from_millis)
    }
}

/// Per-agent behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Gateway port the call-center socket listens on.
    pub port: u16,
    pub auto_accept_enabled: bool,
    pub auto_accept_delay_ms: u64,
    /// Wrap-up period entered after each call. Zero disables it.
    pub after_call_work_secs: u64,
    /// How long an accept waits for the socket before giving up on the
    /// `accept_call` notification.
    pub accept_handshake_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent-001".to_string(),
            port: 8000,
            auto_accept_enabled: false,
            auto_accept_delay_ms: 3_000,
            after_call_work_secs: 30,
            accept_handshake_timeout_ms: 5_000,
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub const fn auto_accept_delay(&self) -> Duration {
        Duration::from_millis(self.auto_accept_delay_ms)
    }

    #[must_use]
    pub const fn accept_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_handshake_timeout_ms)
    }
}

/// AI simulation side-channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AiServiceConfig {
    /// Base URL of the AI service. The side-channel is off when unset.
    pub base_url: Option<String>,
}

/// Metrics persistence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the metrics JSON file. Defaults to the user data directory.
    pub metrics_path: Option<PathBuf>,
}

impl DeskConfig {
    /// Load config from `path` (or `call-desk.toml`) if it exists, then
    /// apply environment overrides and validate.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
                tracing::info!(path = %path.display(), "Loaded configuration");
                cfg
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns the TOML error on malformed input.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `CALL_DESK_*` overrides read through `lookup`.
    ///
    /// Empty or unparseable values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("CALL_DESK_BASE_URL") {
            self.connection.base_url = v;
        }
        if let Some(v) = get("CALL_DESK_CALL_CENTER_PATH") {
            self.connection.call_center_path = v;
        }
        if let Some(v) = get("CALL_DESK_AGENT_ID") {
            self.agent.agent_id = v;
        }
        if let Some(v) = get("CALL_DESK_AI_SERVICE_URL") {
            self.ai_service.base_url = Some(v);
        }
        if let Some(v) = get("CALL_DESK_METRICS_PATH") {
            self.storage.metrics_path = Some(PathBuf::from(v));
        }

        override_parsed(&get, "CALL_DESK_PORT", &mut self.agent.port);
        override_parsed(&get, "CALL_DESK_AUTO_ACCEPT", &mut self.agent.auto_accept_enabled);
        override_parsed(&get, "CALL_DESK_AUTO_ACCEPT_DELAY_MS", &mut self.agent.auto_accept_delay_ms);
        override_parsed(&get, "CALL_DESK_AFTER_CALL_WORK_SECS", &mut self.agent.after_call_work_secs);
        override_parsed(&get, "CALL_DESK_RECONNECT_BASE_MS", &mut self.connection.reconnect_base_ms);
        override_parsed(
            &get,
            "CALL_DESK_RECONNECT_MAX_DELAY_MS",
            &mut self.connection.reconnect_max_delay_ms,
        );
        override_parsed(
            &get,
            "CALL_DESK_MAX_RECONNECT_ATTEMPTS",
            &mut self.connection.max_reconnect_attempts,
        );
        override_parsed(
            &get,
            "CALL_DESK_HEARTBEAT_INTERVAL_MS",
            &mut self.connection.heartbeat_interval_ms,
        );
        if let Some(v) = get("CALL_DESK_HEARTBEAT_TIMEOUT_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            self.connection.heartbeat_timeout_ms = Some(ms);
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = Url::parse(&self.connection.base_url).map_err(|e| {
            ConfigError::Invalid(format!("connection.base_url {:?}: {e}", self.connection.base_url))
        })?;
        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "connection.base_url must use ws:// or wss://, got {}",
                base.scheme()
            )));
        }
        if !self.connection.call_center_path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "connection.call_center_path must start with '/'".to_string(),
            ));
        }
        if self.connection.reconnect_base_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection.reconnect_base_ms must be > 0".to_string(),
            ));
        }
        if self.connection.reconnect_max_delay_ms < self.connection.reconnect_base_ms {
            return Err(ConfigError::Invalid(
                "connection.reconnect_max_delay_ms must be >= reconnect_base_ms".to_string(),
            ));
        }
        if self.connection.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if let Some(timeout) = self.connection.heartbeat_timeout_ms
            && timeout <= self.connection.heartbeat_interval_ms
        {
            return Err(ConfigError::Invalid(
                "connection.heartbeat_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        if self.agent.agent_id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.agent_id must not be empty".to_string()));
        }
        if let Some(ref url) = self.ai_service.base_url {
            Url::parse(url).map_err(|e| {
                ConfigError::Invalid(format!("ai_service.base_url {url:?}: {e}"))
            })?;
        }
        if self.connection.max_reconnect_attempts == 0 {
            tracing::warn!("connection.max_reconnect_attempts is 0, connection drops are terminal");
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    if let Some(raw) = get(key) {
        match raw.parse::<T>() {
            Ok(v) => *field = v,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable override"),
        }
    }
}
