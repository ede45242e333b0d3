//! Node configuration: `skein.toml` in the data directory, with CLI flags
//! overriding file values.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use serde::Deserialize;

use crate::constants::{DEFAULT_API_PORT, DEFAULT_PEERING_PORT, MAX_FEE_INPUTS_DEFAULT};
use crate::ledger::ChainID;
use crate::network::peering::PeersConfig;
use crate::sequencer::{SequencerConfig, DEFAULT_MILESTONE_PACE_TICKS};

/// Configuration file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "skein.toml";

/// Errors resolving configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't parse {0}: {1}")]
    Parse(PathBuf, String),
    #[error("sequencer '{0}': bad chain id")]
    BadChainId(String),
    #[error("sequencer '{0}': bad controller key")]
    BadControllerKey(String),
    #[error("peer '{0}': bad address '{1}'")]
    BadPeerAddress(String, String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Path of the multi-state database, relative to the data directory.
    pub multi_state_db: String,
    pub tx_store: TxStoreSection,
    pub peering: PeeringSection,
    pub api: ApiSection,
    pub sequencers: BTreeMap<String, SequencerSection>,
    /// Trace categories to enable (attach, milestone, tippool, txinput,
    /// propose, pull, sequencer).
    pub trace_tags: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TxStoreSection {
    /// `dummy` keeps bytes in memory; `db` persists them.
    #[serde(rename = "type")]
    pub store_type: String,
    pub path: String,
}

impl Default for TxStoreSection {
    fn default() -> Self {
        TxStoreSection {
            store_type: "db".into(),
            path: "txstore".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PeeringSection {
    pub host_port: u16,
    /// name -> "host:port"
    pub known_peers: BTreeMap<String, String>,
}

impl Default for PeeringSection {
    fn default() -> Self {
        PeeringSection {
            host_port: DEFAULT_PEERING_PORT,
            known_peers: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub server: ApiServerSection,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApiServerSection {
    pub port: u16,
}

impl Default for ApiServerSection {
    fn default() -> Self {
        ApiServerSection {
            port: DEFAULT_API_PORT,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SequencerSection {
    /// Hex of the 32-byte chain id this node operates.
    pub chain_id: String,
    /// Hex of the 32-byte Ed25519 private key seed.
    pub controller_key: String,
    pub max_fee_inputs: usize,
    /// Ticks between own milestones.
    pub pace: u64,
}

impl NodeConfig {
    fn with_defaults(mut self) -> Self {
        if self.multi_state_db.is_empty() {
            self.multi_state_db = "multi-state".into();
        }
        self
    }

    /// Load `skein.toml` from the data directory; defaults when absent.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let config = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<NodeConfig>(&contents)
                .map_err(|e| ConfigError::Parse(path.clone(), e.to_string()))?,
            Err(_) => NodeConfig::default(),
        };
        Ok(config.with_defaults())
    }

    pub fn multi_state_db_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.multi_state_db)
    }

    pub fn tx_store_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.tx_store.path)
    }

    /// Resolve the peering section.
    pub fn peers_config(&self) -> Result<PeersConfig, ConfigError> {
        let mut known_peers = Vec::new();
        for (name, addr) in &self.peering.known_peers {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| ConfigError::BadPeerAddress(name.clone(), addr.clone()))?;
            known_peers.push((name.clone(), addr));
        }
        Ok(PeersConfig {
            host_port: self.peering.host_port,
            known_peers,
        })
    }

    /// Resolve all sequencer profiles, in stable name order.
    pub fn sequencer_configs(&self) -> Result<Vec<SequencerConfig>, ConfigError> {
        let mut ret = Vec::new();
        for (name, section) in &self.sequencers {
            let chain_bytes = hex::decode(&section.chain_id)
                .map_err(|_| ConfigError::BadChainId(name.clone()))?;
            let chain_id = ChainID::from_bytes(&chain_bytes)
                .map_err(|_| ConfigError::BadChainId(name.clone()))?;
            let key_bytes = hex::decode(&section.controller_key)
                .map_err(|_| ConfigError::BadControllerKey(name.clone()))?;
            let seed: [u8; 32] = key_bytes
                .try_into()
                .map_err(|_| ConfigError::BadControllerKey(name.clone()))?;
            ret.push(SequencerConfig {
                name: name.clone(),
                chain_id,
                controller_key: SigningKey::from_bytes(&seed),
                max_fee_inputs: if section.max_fee_inputs == 0 {
                    MAX_FEE_INPUTS_DEFAULT
                } else {
                    section.max_fee_inputs
                },
                pace_ticks: if section.pace == 0 {
                    DEFAULT_MILESTONE_PACE_TICKS
                } else {
                    section.pace
                },
            });
        }
        Ok(ret)
    }

    /// Tracing filter directives for the enabled trace tags.
    pub fn trace_directives(&self) -> Vec<String> {
        self.trace_tags
            .iter()
            .map(|tag| format!("{}=trace", tag))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(config.peering.host_port, DEFAULT_PEERING_PORT);
        assert_eq!(config.api.server.port, DEFAULT_API_PORT);
        assert_eq!(config.multi_state_db, "multi-state");
        assert!(config.sequencers.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
multi_state_db = "db"
trace_tags = ["attach", "tippool"]

[tx_store]
type = "dummy"

[peering]
host_port = 5000

[peering.known_peers]
alice = "127.0.0.1:5001"

[api.server]
port = 9000

[sequencers.boot]
chain_id = "0101010101010101010101010101010101010101010101010101010101010101"
controller_key = "0202020202020202020202020202020202020202020202020202020202020202"
max_fee_inputs = 10
"#;
        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tx_store.store_type, "dummy");
        assert_eq!(config.api.server.port, 9000);
        let peers = config.peers_config().unwrap();
        assert_eq!(peers.known_peers.len(), 1);
        let seqs = config.sequencer_configs().unwrap();
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].max_fee_inputs, 10);
        assert_eq!(config.trace_directives(), vec!["attach=trace", "tippool=trace"]);
    }

    #[test]
    fn bad_peer_address_rejected() {
        let mut config = NodeConfig::default();
        config
            .peering
            .known_peers
            .insert("bob".into(), "not-an-addr".into());
        assert!(config.peers_config().is_err());
    }
}
