// Configuration module for the DHT storage node
//
// This module handles loading and managing the storage node configuration

use crate::error::{DhtError, Result};
use crate::ring::{self, RingPosition};
use crate::types::NodeInfo;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local node identity
    pub node: NodeConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// DHT tuning
    #[serde(default)]
    pub dht: DhtConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID
    pub id: String,
    /// Ring address as hex; derived from the id when absent
    pub address: Option<String>,
    /// Endpoint other nodes reach this node at
    pub endpoint: String,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// DHT tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Replication degree is `2^degree_exponent`
    #[serde(default)]
    pub degree_exponent: u32,
    /// Concurrent PutApply calls per migration
    #[serde(default = "default_max_parallel_transfers")]
    pub max_parallel_transfers: usize,
    /// Expiry sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per-RPC timeout in milliseconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
    /// Retry interval for failed proxy registrations in seconds
    #[serde(default = "default_proxy_retry")]
    pub proxy_retry_secs: u64,
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Statically known peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: Option<String>,
    pub endpoint: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_parallel_transfers() -> usize {
    10
}

fn default_sweep_interval() -> u64 {
    24 * 60 * 60
}

fn default_rpc_timeout() -> u64 {
    30_000
}

fn default_proxy_retry() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a file, with `DHT__SECTION__KEY` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("DHT").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| DhtError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, config_str)
            .map_err(|e| DhtError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.dht.degree_exponent > 16 {
            return Err(DhtError::Config(format!(
                "degree_exponent {} is too large",
                self.dht.degree_exponent
            )));
        }
        if self.dht.max_parallel_transfers == 0 {
            return Err(DhtError::Config(
                "max_parallel_transfers must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("sweep_interval_secs", self.dht.sweep_interval_secs),
            ("rpc_timeout_ms", self.dht.rpc_timeout_ms),
            ("proxy_retry_secs", self.dht.proxy_retry_secs),
        ] {
            if value == 0 {
                return Err(DhtError::Config(format!("{} must be at least 1", name)));
            }
        }
        self.local_node()?;
        self.peer_nodes()?;
        Ok(())
    }

    /// The local node described by `[node]`
    pub fn local_node(&self) -> Result<NodeInfo> {
        node_info(&self.node.id, self.node.address.as_deref(), &self.node.endpoint)
    }

    /// Peers listed under `[network]`
    pub fn peer_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.network
            .peers
            .iter()
            .map(|peer| node_info(&peer.id, peer.address.as_deref(), &peer.endpoint))
            .collect()
    }

    pub fn degree(&self) -> usize {
        ring::degree_for_exponent(self.dht.degree_exponent)
    }
}

fn node_info(id: &str, address: Option<&str>, endpoint: &str) -> Result<NodeInfo> {
    match address {
        Some(hex) => {
            let position: RingPosition = hex
                .parse()
                .map_err(|e| DhtError::Config(format!("Invalid ring address {}: {}", hex, e)))?;
            Ok(NodeInfo::with_address(id, position, endpoint))
        }
        None => Ok(NodeInfo::new(id, endpoint)),
    }
}

impl DhtConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn proxy_retry(&self) -> Duration {
        Duration::from_secs(self.proxy_retry_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        let id = format!("node-{}", uuid::Uuid::new_v4());
        Self {
            node: NodeConfig {
                id,
                address: None,
                endpoint: format!("http://{}", default_bind_address()),
            },
            api: ApiConfig::default(),
            dht: DhtConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            degree_exponent: 0,
            max_parallel_transfers: default_max_parallel_transfers(),
            sweep_interval_secs: default_sweep_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
            proxy_retry_secs: default_proxy_retry(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Generate a default configuration file at the given path if it doesn't exist
pub fn ensure_default_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    if !path.as_ref().exists() {
        let default_config = Config::default();
        default_config.to_file(&path)?;
        return Ok(default_config);
    }

    Config::from_file(path)
}
