//! Configuration management for the sync daemon.
//!
//! A single TOML file with `[node]`, `[network]`, `[sync]`, `[storage]` and
//! `[logging]` sections. On first run, if no config exists, one is written
//! with defaults and a per-network data directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::chain::BlockSyncConfig;
use crate::constants::{chain, network, sync};
use crate::error::AppError;
use crate::network::PoolConfig;
use crate::network_type::NetworkType;

/// Platform-specific data directory
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\chainsyncd
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chainsyncd")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chainsyncd")
    }
}

/// Network-specific subdirectory; mainnet uses the base directory
pub fn get_network_data_dir(network: &NetworkType) -> PathBuf {
    let base = get_data_dir();
    match network {
        NetworkType::Mainnet => base,
        other => base.join(other.as_str()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_network() -> String {
    "mainnet".to_string()
}

fn default_user_agent() -> String {
    format!("/chainsyncd:{}/", env!("CARGO_PKG_VERSION"))
}

impl NodeConfig {
    pub fn network_type(&self) -> Result<NetworkType, AppError> {
        self.network.parse().map_err(AppError::Config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Inbound listener; none means outbound-only
    #[serde(default)]
    pub listen_address: Option<String>,
    pub max_peers: usize,
    /// Overrides the network's built-in DNS seeds when non-empty
    #[serde(default)]
    pub dns_seeds: Vec<String>,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    pub retry_cooldown_secs: u64,
    pub reconnect_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

impl NetworkConfig {
    /// Listen address with the network's default port filled in.
    pub fn full_listen_address(&self, network_type: &NetworkType) -> Result<Option<SocketAddr>, AppError> {
        let Some(addr) = self.listen_address.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(None);
        };
        let full = if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{}:{}", addr, network_type.default_p2p_port())
        };
        full.parse()
            .map(Some)
            .map_err(|e| AppError::Config(format!("invalid listen_address {}: {}", full, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub checkpoint_distance: u64,
    /// Recent hash ring capacity
    pub reorg_window: usize,
    pub block_read_ahead: u64,
    pub block_request_timeout_secs: u64,
    pub header_request_timeout_secs: u64,
    pub progress_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_distance: chain::DEFAULT_CHECKPOINT_DISTANCE,
            reorg_window: chain::DEFAULT_REORG_WINDOW,
            block_read_ahead: sync::DEFAULT_BLOCK_READ_AHEAD,
            block_request_timeout_secs: sync::DEFAULT_BLOCK_REQUEST_TIMEOUT_SECS,
            header_request_timeout_secs: sync::DEFAULT_HEADER_REQUEST_TIMEOUT_SECS,
            progress_interval_secs: sync::DEFAULT_PROGRESS_INTERVAL_SECS,
        }
    }
}

impl SyncConfig {
    pub fn block_sync(&self) -> BlockSyncConfig {
        BlockSyncConfig {
            read_ahead: self.block_read_ahead,
            request_timeout: Duration::from_secs(self.block_request_timeout_secs),
            ring_capacity: self.reorg_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sled" or "memory"
    pub backend: String,
    pub data_dir: String,
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u64,
}

fn default_cache_size_mb() -> u64 {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_for(network_type: NetworkType) -> Self {
        Self {
            node: NodeConfig {
                network: network_type.as_str().to_string(),
                user_agent: default_user_agent(),
            },
            network: NetworkConfig {
                listen_address: None,
                max_peers: network::DEFAULT_MAX_PEERS,
                dns_seeds: vec![],
                bootstrap_peers: vec![],
                keep_alive: true,
                retry_cooldown_secs: network::DEFAULT_RETRY_COOLDOWN_SECS,
                reconnect_interval_secs: network::DEFAULT_RECONNECT_INTERVAL_SECS,
            },
            sync: SyncConfig::default(),
            storage: StorageConfig {
                backend: "sled".to_string(),
                data_dir: get_network_data_dir(&network_type)
                    .to_string_lossy()
                    .to_string(),
                cache_size_mb: default_cache_size_mb(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
                output: "stdout".to_string(),
                file_path: "./logs/chainsyncd.log".to_string(),
            },
        }
    }

    /// Load `path`, or write and return defaults for `network_type` when it
    /// does not exist.
    pub fn load_or_create(
        path: &str,
        network_type: &NetworkType,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if fs::metadata(path).is_ok() {
            let mut config = Self::load_from_file(path)?;
            if config.storage.data_dir.is_empty() {
                let network = config.node.network_type()?;
                config.storage.data_dir = get_network_data_dir(&network)
                    .to_string_lossy()
                    .to_string();
            }
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default_for(*network_type);
            config.save_to_file(path)?;
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = PathBuf::from(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let network = self.node.network_type()?;
        self.network.full_listen_address(&network)?;

        let sync = &self.sync;
        if sync.checkpoint_distance == 0
            || sync.reorg_window == 0
            || sync.block_read_ahead == 0
            || sync.block_request_timeout_secs == 0
            || sync.header_request_timeout_secs == 0
            || sync.progress_interval_secs == 0
        {
            return Err(AppError::Config(
                "[sync] values must all be positive".to_string(),
            ));
        }
        // A fork the ring can resolve must survive a restart rewind
        if sync.checkpoint_distance < sync.reorg_window as u64 {
            return Err(AppError::Config(format!(
                "checkpoint_distance ({}) must be at least reorg_window ({})",
                sync.checkpoint_distance, sync.reorg_window
            )));
        }
        if self.network.max_peers == 0 {
            return Err(AppError::Config("max_peers must be positive".to_string()));
        }
        match self.storage.backend.as_str() {
            "sled" | "memory" => {}
            other => {
                return Err(AppError::Config(format!(
                    "unknown storage backend '{}'",
                    other
                )))
            }
        }
        match self.logging.output.as_str() {
            "stdout" | "file" => Ok(()),
            other => Err(AppError::Config(format!(
                "unknown logging output '{}'",
                other
            ))),
        }
    }

    /// Connection pool settings with network defaults filled in.
    pub fn pool_config(&self) -> Result<PoolConfig, AppError> {
        let network_type = self.node.network_type()?;
        let dns_seeds = if self.network.dns_seeds.is_empty() {
            network_type
                .dns_seeds()
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.network.dns_seeds.clone()
        };

        Ok(PoolConfig {
            network: network_type,
            max_peers: self.network.max_peers,
            listen_address: self.network.full_listen_address(&network_type)?,
            dns_seeds,
            bootstrap_peers: self.network.bootstrap_peers.clone(),
            keep_alive: self.network.keep_alive,
            retry_cooldown: Duration::from_secs(self.network.retry_cooldown_secs),
            max_retry_cooldown: Duration::from_secs(network::MAX_RETRY_COOLDOWN_SECS),
            reconnect_interval: Duration::from_secs(self.network.reconnect_interval_secs),
            user_agent: self.node.user_agent.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default_for(NetworkType::Regtest);
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.checkpoint_distance, 2000);
        assert_eq!(config.sync.reorg_window, 144);
        assert!(config.storage.data_dir.ends_with("regtest"));
    }

    #[test]
    fn test_checkpoint_must_cover_reorg_window() {
        let mut config = Config::default_for(NetworkType::Regtest);
        config.sync.checkpoint_distance = 100;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        config.sync.checkpoint_distance = 2000;
        config.sync.block_read_ahead = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        let created = Config::load_or_create(path, &NetworkType::Testnet).unwrap();
        assert_eq!(created.node.network, "testnet");

        let loaded = Config::load_or_create(path, &NetworkType::Mainnet).unwrap();
        assert_eq!(loaded.node.network, "testnet");
        assert_eq!(loaded.sync.block_read_ahead, created.sync.block_read_ahead);
    }

    #[test]
    fn test_missing_sync_section_uses_defaults() {
        let toml = r#"
            [node]
            network = "regtest"

            [network]
            listen_address = "127.0.0.1"
            max_peers = 4
            retry_cooldown_secs = 5
            reconnect_interval_secs = 5

            [storage]
            backend = "memory"
            data_dir = "/tmp/x"

            [logging]
            level = "debug"
            format = "json"
            output = "stdout"
            file_path = "./x.log"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.reorg_window, 144);

        let pool = config.pool_config().unwrap();
        assert_eq!(
            pool.listen_address,
            Some(
                format!("127.0.0.1:{}", NetworkType::Regtest.default_p2p_port())
                    .parse()
                    .unwrap()
            )
        );
        assert_eq!(pool.dns_seeds.len(), NetworkType::Regtest.dns_seeds().len());
    }
}
