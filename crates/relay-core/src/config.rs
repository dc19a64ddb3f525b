//! Gateway configuration.
//!
//! Loaded from a JSON file with camelCase keys. Every field has a default,
//! so an absent file or a partial file is valid. String values may refer to
//! environment variables as `${NAME}`.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Config file name searched in the working directory and `~/.relay/`.
pub const CONFIG_FILE_NAME: &str = "relay.json";

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 3;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Session lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Inactivity after which a session expires.
    pub timeout_minutes: u64,
    /// Maximum live sessions before eviction kicks in.
    pub max_concurrent: usize,
    /// Interval between expiry sweeps.
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            max_concurrent: 50,
            sweep_interval_secs: 60,
        }
    }
}

/// Streaming delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingConfig {
    /// Throttle window for non-terminal chat events.
    pub throttle_ms: u64,
}

impl StreamingConfig {
    #[must_use]
    pub const fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { throttle_ms: 150 }
    }
}

/// Supported wire protocol range and handshake limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolConfig {
    pub min_version: u32,
    pub max_version: u32,
    pub handshake_timeout_ms: u64,
}

impl ProtocolConfig {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_version: PROTOCOL_VERSION,
            max_version: PROTOCOL_VERSION,
            handshake_timeout_ms: 10_000,
        }
    }
}

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18800,
        }
    }
}

/// Agent engine selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Provider plugin name. `None` leaves the engine unavailable.
    pub backend: Option<String>,
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub session: SessionConfig,
    pub streaming: StreamingConfig,
    pub protocol: ProtocolConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `./relay.json` and then
    /// `~/.relay/relay.json` are tried, falling back to defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = find_config_file(explicit)? else {
            tracing::info!("No config file found, using defaults");
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Parse, substitute `${VAR}` placeholders and validate.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut value: Value = serde_json::from_str(raw)?;
        substitute_env_vars(&mut value);
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns error describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_concurrent == 0 {
            return Err(ConfigError::Invalid("session.maxConcurrent must be at least 1".into()));
        }
        if self.session.timeout_minutes == 0 {
            return Err(ConfigError::Invalid("session.timeoutMinutes must be at least 1".into()));
        }
        if self.streaming.throttle_ms == 0 {
            return Err(ConfigError::Invalid("streaming.throttleMs must be at least 1".into()));
        }
        if self.protocol.min_version > self.protocol.max_version {
            return Err(ConfigError::Invalid(format!(
                "protocol.minVersion {} exceeds protocol.maxVersion {}",
                self.protocol.min_version, self.protocol.max_version
            )));
        }
        Ok(())
    }
}

fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".relay").join(CONFIG_FILE_NAME));
    }
    Ok(candidates.into_iter().find(|p| p.is_file()))
}

fn substitute_env_vars(value: &mut Value) {
    match value {
        Value::String(s) if s.contains('$') => *s = expand_placeholders(s),
        Value::Array(items) => items.iter_mut().for_each(substitute_env_vars),
        Value::Object(map) => map.values_mut().for_each(substitute_env_vars),
        _ => {}
    }
}

/// Expand `${NAME}` and `$NAME`; unset variables expand to "".
fn expand_placeholders(input: &str) -> String {
    shellexpand::env_with_context_no_errors(input, |name| {
        Some(env::var(name).unwrap_or_default())
    })
    .into_owned()
}
