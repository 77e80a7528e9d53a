//! Configuration system for Shard.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHARD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shard/config.toml
//!   3. ~/.config/shard/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::peer::{PeerId, PeerRecord};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Static peer roster, read at start-up.
    pub peers: Vec<PeerRecord>,
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id, stamped as `sender` on outbound envelopes.
    pub id: PeerId,
    /// Address the inbound listener binds.
    pub listen_addr: String,
    /// TCP port for inbound peer connections. 0 = OS-assigned.
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding complete and partial files.
    pub root: PathBuf,
    /// Largest file a peer may announce or start sending, in bytes.
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Deadline for establishing an outbound connection.
    pub connect_timeout_ms: u64,
    /// Deadline for writing one envelope.
    pub write_timeout_ms: u64,
    /// First reconnect backoff window after a failed connect.
    pub backoff_base_ms: u64,
    /// Upper bound for the reconnect backoff window.
    pub backoff_max_ms: u64,
    /// How long shutdown waits for workers before aborting them.
    pub shutdown_grace_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 7400,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("files"),
            max_file_size: 64 << 30,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            write_timeout_ms: 10_000,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
            shutdown_grace_ms: 500,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("shard")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("shard")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ShardConfig {
    /// Load config from the default location: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load config from an explicit path, falling back to defaults if absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            ShardConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ShardConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SHARD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SHARD_NODE__ID") {
            if let Ok(id) = v.parse() {
                self.node.id = id;
            }
        }
        if let Ok(v) = std::env::var("SHARD_NODE__LISTEN_ADDR") {
            self.node.listen_addr = v;
        }
        if let Ok(v) = std::env::var("SHARD_NODE__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.node.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("SHARD_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHARD_STORAGE__MAX_FILE_SIZE") {
            if let Ok(n) = v.parse() {
                self.storage.max_file_size = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ShardConfig::default();
        assert_eq!(config.node.listen_port, 7400);
        assert!(config.peers.is_empty());
        assert_eq!(config.transport.connect_timeout(), Duration::from_secs(3));
        assert!(config.transport.backoff_base() < config.transport.backoff_max());
        assert_eq!(config.storage.max_file_size, 64 * 1024 * 1024 * 1024);
    }

    #[test]
    fn max_file_size_is_configurable() {
        let config = ShardConfig::parse("[storage]\nmax_file_size = 1048576\n").unwrap();
        assert_eq!(config.storage.max_file_size, 1 << 20);
    }

    #[test]
    fn parses_roster_and_partial_sections() {
        let text = r#"
            [node]
            id = 4

            [transport]
            write_timeout_ms = 250

            [[peers]]
            id = 1
            address = "10.0.0.1"
            port = 7400

            [[peers]]
            id = 2
            address = "node-b.lan"
            port = 7401
        "#;
        let config = ShardConfig::parse(text).unwrap();
        assert_eq!(config.node.id, 4);
        assert_eq!(config.node.listen_addr, "127.0.0.1");
        assert_eq!(config.transport.write_timeout(), Duration::from_millis(250));
        assert_eq!(config.transport.connect_timeout_ms, 3_000);
        assert_eq!(
            config.peers,
            vec![
                PeerRecord::new(1, "10.0.0.1", 7400),
                PeerRecord::new(2, "node-b.lan", 7401),
            ]
        );
    }

    #[test]
    fn load_from_missing_path_gives_defaults() {
        let path = std::env::temp_dir().join(format!(
            "shard-config-missing-{}/config.toml",
            std::process::id()
        ));
        let config = ShardConfig::load_from(&path).unwrap();
        assert_eq!(config.transport.shutdown_grace_ms, 500);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("shard-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        std::env::set_var("SHARD_CONFIG", config_path.to_str().unwrap());

        let path = ShardConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = ShardConfig::load().expect("load should succeed");
        assert!(config.peers.is_empty());

        std::env::remove_var("SHARD_CONFIG");
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
