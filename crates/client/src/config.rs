//! Client configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use chatlink_common::CHAT_PATH_PREFIX;

use crate::error::{ClientError, Result};
use crate::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_MISSED};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::reconnect::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl ClientConfig {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "chatlink", "chatlink") {
            config_dir.config_dir().join("client.toml")
        } else {
            PathBuf::from("client.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.session_id.trim().is_empty() {
            return Err(ClientError::InvalidConfig("session_id is empty".to_string()));
        }
        if self.queue.capacity == 0 {
            return Err(ClientError::InvalidConfig("queue capacity must be at least 1".to_string()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ClientError::InvalidConfig("heartbeat interval must be non-zero".to_string()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ClientError::InvalidConfig(
                "reconnect base delay exceeds max delay".to_string(),
            ));
        }
        self.connection.chat_url().map(|_| ())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// HTTP(S) address of the chat service; `https` selects `wss`
    pub base_address: String,
    pub session_id: String,
    /// Bearer token, passed as the `token` query parameter
    pub token: String,
    pub auto_connect: bool,
    pub auto_reconnect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            base_address: "http://localhost:8000".to_string(),
            session_id: String::new(),
            token: String::new(),
            auto_connect: true,
            auto_reconnect: true,
        }
    }
}

impl ConnectionSettings {
    /// `{ws|wss}://{host}/ws/chat/{session_id}?token={token}`, with the
    /// session id and token percent-encoded.
    pub fn chat_url(&self) -> Result<String> {
        Ok(self.build_url(&self.token)?.into())
    }

    /// The chat URL without the token, for logging.
    pub fn redacted_url(&self) -> String {
        match self.build_url("***") {
            Ok(url) => url.into(),
            Err(_) => self.base_address.clone(),
        }
    }

    fn build_url(&self, token: &str) -> Result<Url> {
        let base = self.base_address.trim();
        // A bare `host:port` is taken as plain http.
        let base = if base.contains("://") {
            base.to_string()
        } else {
            format!("http://{}", base)
        };

        let mut url = Url::parse(&base).map_err(|e| {
            ClientError::InvalidConfig(format!("Invalid base address {:?}: {}", self.base_address, e))
        })?;

        if url.host_str().map_or(true, str::is_empty) {
            return Err(ClientError::InvalidConfig(format!(
                "Base address {:?} has no host",
                self.base_address
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ClientError::InvalidConfig(
                "Base address must not include username/password credentials".to_string(),
            ));
        }

        let ws_scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ClientError::InvalidConfig(format!(
                    "Unsupported base address scheme '{}'; expected http(s) or ws(s)",
                    other
                )));
            }
        };
        url.set_scheme(ws_scheme).map_err(|_| {
            ClientError::InvalidConfig("Failed to set WebSocket URL scheme".to_string())
        })?;

        url.set_fragment(None);
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidConfig("Base address cannot carry a path".to_string()))?
            .clear()
            .extend(CHAT_PATH_PREFIX.split('/').filter(|s| !s.is_empty()))
            .push(&self.session_id);
        url.query_pairs_mut().append_pair("token", token);

        Ok(url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    /// Probes that may go unanswered before the connection is forced closed
    pub max_missed: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Unlimited when absent
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            max_attempts: None,
        }
    }
}

impl ReconnectSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

pub fn generate_example_config() -> String {
    let mut config = ClientConfig::default();
    config.connection.session_id = "my-session".to_string();
    config.connection.token = "replace-with-token".to_string();
    toml::to_string_pretty(&config).expect("Failed to serialize default config")
}
