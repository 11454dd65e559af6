//! Ingest configuration
//!
//! Settings come from an optional TOML file. Every section and field has a
//! default, so an empty file (or no file) yields a working single-node
//! server backed by the in-memory store. Command line flags are applied on
//! top in `main`.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! max_clients = 500
//!
//! [store]
//! url = "redis://127.0.0.1:6379"
//! channel = "room"
//! client_name = "ingest"
//! leader_interval_ms = 1000
//!
//! [auth]
//! jwt_secret = "change-me"
//! sso_url = "https://my.hackmit.org/auth/sso/exchange"
//!
//! [achievements]
//! num_events = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub auth: AuthSettings,
    pub world: WorldSettings,
    pub achievements: AchievementSettings,
    pub video: VideoSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_clients: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Redis url. Without one the ingest runs alone on the in-memory store.
    pub url: Option<String>,
    pub channel: String,
    pub client_name: String,
    pub leader_interval_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: None,
            channel: "room".to_string(),
            client_name: "ingest".to_string(),
            leader_interval_ms: 1000,
        }
    }
}

impl StoreSettings {
    pub fn leader_interval(&self) -> Duration {
        Duration::from_millis(self.leader_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: String,
    /// SSO token exchange endpoint; SSO logins are refused when unset.
    pub sso_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub default_room: String,
    pub default_background: String,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            default_room: shared::DEFAULT_ROOM.to_string(),
            default_background: "town.png".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AchievementSettings {
    /// Attended events needed for the `events` achievement.
    pub num_events: i64,
}

impl Default for AchievementSettings {
    fn default() -> Self {
        Self { num_events: 5 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// YouTube Data API key; songs cannot be queued without it.
    pub api_key: Option<String>,
}

impl Settings {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_clients == 0 {
            return Err(ConfigError::Invalid(
                "server.max_clients must be at least 1".to_string(),
            ));
        }
        if self.store.channel.is_empty() || self.store.client_name.is_empty() {
            return Err(ConfigError::Invalid(
                "store.channel and store.client_name must not be empty".to_string(),
            ));
        }
        if self.store.leader_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.leader_interval_ms must be positive".to_string(),
            ));
        }
        if self.world.default_room.is_empty() {
            return Err(ConfigError::Invalid(
                "world.default_room must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
