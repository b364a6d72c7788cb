use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use parley_store::RetentionConfig;

use crate::error::ConfigError;

/// Reconnection, heartbeat and fan-out timing for relay connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier applied per failed attempt.
    #[serde(default = "default_growth")]
    pub growth: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Relative jitter, e.g. 0.3 for +/-30%.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Heartbeat period once open. 0 disables heartbeats.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// How long a connection with no listeners stays open.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_growth() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.3
}

fn default_heartbeat_interval_secs() -> u64 {
    25
}

fn default_grace_ms() -> u64 {
    1_500
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            growth: default_growth(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            grace_ms: default_grace_ms(),
        }
    }
}

impl TransportConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.growth < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "transport.growth must be >= 1.0, got {}",
                self.growth
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "transport.jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid(
                "transport delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Client configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay origin, e.g. `wss://chat.example.com`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Base URL of the REST API (directory and history).
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Where keys and cached messages live. Defaults to the platform data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,

    #[serde(default = "default_key_bits")]
    pub key_bits: usize,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:8000".into()
}

fn default_socket_path() -> String {
    "/ws/chat/".into()
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000/api".into()
}

fn default_history_page_size() -> u32 {
    30
}

fn default_key_bits() -> usize {
    parley_crypto::identity::DEFAULT_KEY_BITS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            socket_path: default_socket_path(),
            api_base_url: default_api_base_url(),
            data_dir: None,
            history_page_size: default_history_page_size(),
            key_bits: default_key_bits(),
            transport: TransportConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Platform data directory for parley (`~/.local/share/parley` on Linux).
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save atomically (write to .tmp, then rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".into()));
        }
        if !self.socket_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "socket_path must start with '/', got {:?}",
                self.socket_path
            )));
        }
        if self.history_page_size == 0 {
            return Err(ConfigError::Invalid("history_page_size must be > 0".into()));
        }
        self.transport.validate()
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}
