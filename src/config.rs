//! Configuration file support for the Tempora node.
//!
//! Loads optional `tempora.toml` from the data directory. CLI flags override
//! config file values. The configuration object is immutable after startup;
//! unknown options and out-of-range values are startup errors (exit code 1).

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::constants;

/// Errors from configuration loading and validation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration option: {0}")]
    UnknownOption(String),
    #[error("configuration value out of range: {0}")]
    OutOfRange(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemporaConfig {
    pub node: NodeSection,
    pub protocol: ProtocolSection,
    pub network: NetworkSection,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSection {
    pub p2p_host: String,
    pub p2p_port: u16,
    pub control_host: String,
    pub control_port: u16,
    pub data_dir: String,
    pub bootstrap_peers: Vec<String>,
    /// Participation tier: 1 full, 2 light, 3 attestation-only.
    pub tier: u8,
    /// Allow running without peers (single-participant networks, tests).
    pub standalone: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            p2p_host: "0.0.0.0".into(),
            p2p_port: constants::DEFAULT_P2P_PORT,
            control_host: "127.0.0.1".into(),
            control_port: constants::DEFAULT_CONTROL_PORT,
            data_dir: "./tempora-data".into(),
            bootstrap_peers: vec![],
            tier: 1,
            standalone: false,
        }
    }
}

/// Protocol parameters. Defaults are the mainnet set; changing them forks
/// the node off the network.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolSection {
    pub finality_interval_seconds: u64,
    pub clock_tolerance_seconds: u64,
    pub vdf_iterations: u64,
    pub max_parents: usize,
    pub phantom_k: usize,
    pub mempool_bytes_max: usize,
    pub block_bytes_max: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        ProtocolSection {
            finality_interval_seconds: constants::FINALITY_INTERVAL_SECS,
            clock_tolerance_seconds: constants::CLOCK_TOLERANCE_SECS,
            vdf_iterations: constants::VDF_ITERATIONS,
            max_parents: constants::MAX_PARENTS,
            phantom_k: constants::PHANTOM_K,
            mempool_bytes_max: constants::MEMPOOL_MAX_BYTES,
            block_bytes_max: constants::BLOCK_BYTES_MAX,
        }
    }
}

/// Peer-link budgets.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    pub per_peer_recv_bps: u64,
    pub per_peer_send_bps: u64,
    pub min_outbound_peers: usize,
    pub inbound_ratio_max: f64,
    pub max_peers: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        NetworkSection {
            per_peer_recv_bps: constants::PER_PEER_RECV_BPS,
            per_peer_send_bps: constants::PER_PEER_SEND_BPS,
            min_outbound_peers: constants::MIN_OUTBOUND_PEERS,
            inbound_ratio_max: constants::INBOUND_RATIO_MAX,
            max_peers: 64,
        }
    }
}

impl TemporaConfig {
    /// Load configuration from `tempora.toml` in the given directory.
    /// A missing file yields the defaults; a malformed or unknown option
    /// is an error.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = data_dir.join("tempora.toml");
        let contents = match std::fs::read_to_string(&config_path) {
            Ok(contents) => contents,
            Err(_) => return Ok(Self::default()),
        };
        let config = Self::parse(&contents)?;
        tracing::info!(path = %config_path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: TemporaConfig =
            toml::from_str(contents).map_err(|e| ConfigError::UnknownOption(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks over every recognized option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.finality_interval_seconds == 0 {
            return Err(ConfigError::OutOfRange("finality_interval_seconds".into()));
        }
        if self.protocol.clock_tolerance_seconds >= self.protocol.finality_interval_seconds {
            return Err(ConfigError::OutOfRange("clock_tolerance_seconds".into()));
        }
        if !(constants::VDF_MIN_ITERATIONS..=constants::VDF_MAX_ITERATIONS)
            .contains(&self.protocol.vdf_iterations)
        {
            return Err(ConfigError::OutOfRange("vdf_iterations".into()));
        }
        if self.protocol.max_parents == 0 || self.protocol.max_parents > constants::MAX_PARENTS {
            return Err(ConfigError::OutOfRange("max_parents".into()));
        }
        if self.protocol.phantom_k == 0 {
            return Err(ConfigError::OutOfRange("phantom_k".into()));
        }
        if self.protocol.block_bytes_max == 0
            || self.protocol.block_bytes_max > constants::MAX_NETWORK_MESSAGE_BYTES
        {
            return Err(ConfigError::OutOfRange("block_bytes_max".into()));
        }
        if self.protocol.mempool_bytes_max == 0 {
            return Err(ConfigError::OutOfRange("mempool_bytes_max".into()));
        }
        if !(0.0..=1.0).contains(&self.network.inbound_ratio_max) {
            return Err(ConfigError::OutOfRange("inbound_ratio_max".into()));
        }
        if self.network.min_outbound_peers == 0
            || self.network.min_outbound_peers > self.network.max_peers
        {
            return Err(ConfigError::OutOfRange("min_outbound_peers".into()));
        }
        if !(1..=3).contains(&self.node.tier) {
            return Err(ConfigError::OutOfRange("tier".into()));
        }
        Ok(())
    }

    /// Parse bootstrap peers into socket addresses, dropping malformed ones.
    pub fn parse_bootstrap_peers(&self) -> Vec<SocketAddr> {
        self.node
            .bootstrap_peers
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}
