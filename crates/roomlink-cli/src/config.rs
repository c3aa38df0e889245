//! Roomlink CLI Configuration Management
//!
//! Configuration comes from an optional TOML file (by default
//! `<config dir>/roomlink/roomlink.toml`) layered over built-in defaults;
//! command line flags override both. Every table is optional, so a file can
//! carry only the settings it changes.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use roomlink_core::{PeerId, RoomId, RoomlinkConfig};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the Roomlink CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Protocol timers and thresholds shared by server and client
    pub core: RoomlinkConfig,
    pub server: ServerSection,
    pub client: ClientSection,
}

/// Coordinator server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the WebSocket coordinator listens on
    pub listen: String,
    /// Run the liveness sweep over relayed connections
    pub health_monitor: bool,
}

/// Chat client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub coordinator_url: String,
    /// Address direct links are accepted on
    pub direct_listen: String,
    pub display_name: String,
    pub room: String,
    /// Fixed peer ID (16 hex characters); random when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Messages kept per room for replay on join
    pub history_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9400".to_string(),
            health_monitor: true,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            coordinator_url: "ws://127.0.0.1:9400".to_string(),
            direct_listen: "127.0.0.1:0".to_string(),
            display_name: "anonymous".to_string(),
            room: "lobby".to_string(),
            peer_id: None,
            history_size: 500,
        }
    }
}

impl AppConfig {
    /// Default location of the configuration file
    pub fn default_config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("roomlink").join("roomlink.toml"))
            .ok_or_else(|| CliError::Config("No user configuration directory".to_string()))
    }

    /// Load from `path`, falling back to defaults for anything it omits
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the default file when it exists, else use defaults
    pub fn load_default() -> Result<Self> {
        match Self::default_config_path() {
            Ok(path) if path.exists() => Self::load_from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        url::Url::parse(&self.client.coordinator_url)?;
        self.peer_id()?;
        RoomId::new(self.client.room.as_str())?;
        if self.client.display_name.trim().is_empty() {
            return Err(CliError::Config("display_name cannot be empty".to_string()));
        }
        if self.client.history_size == 0 {
            return Err(CliError::Config("history_size must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Configured peer ID, or a fresh random one
    pub fn peer_id(&self) -> Result<PeerId> {
        match &self.client.peer_id {
            Some(hex) => Ok(hex.parse()?),
            None => Ok(PeerId::random()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.room, "lobby");
        assert!(config.server.health_monitor);
    }

    #[test]
    fn test_config_validation() {
        let mut invalid = AppConfig::default();
        invalid.client.peer_id = Some("invalid".to_string());
        assert!(invalid.validate().is_err());

        let mut invalid = AppConfig::default();
        invalid.client.coordinator_url = "not a url".to_string();
        assert!(matches!(invalid.validate(), Err(CliError::InvalidUrl(_))));

        let mut invalid = AppConfig::default();
        invalid.core.bridge.hop_cap = 0;
        assert!(matches!(invalid.validate(), Err(CliError::Roomlink(_))));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let text = r#"
            [client]
            display_name = "ann"
            peer_id = "0102030405060708"
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.client.display_name, "ann");
        assert_eq!(config.client.room, "lobby");
        assert_eq!(config.server.listen, "127.0.0.1:9400");
        assert_eq!(config.peer_id().unwrap().to_string(), "0102030405060708");
        assert_eq!(config.core.bridge.hop_cap, 2);
    }

    #[test]
    fn test_saved_file_loads_back() {
        let path = std::env::temp_dir().join(format!("roomlink-cli-{}.toml", std::process::id()));
        let mut config = AppConfig::default();
        config.client.display_name = "bob".to_string();
        config.core.queue.max_len = 32;

        config.save_to_file(&path).unwrap();
        let loaded = AppConfig::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded.client.display_name, "bob");
        assert_eq!(loaded.core.queue.max_len, 32);
    }
}
