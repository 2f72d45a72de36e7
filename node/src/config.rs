use anyhow::Context;
use ledger_primitives::cluster::ClusterConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "config.json";
pub const NODE_KEY_FILE: &str = "node_key.json";

const SUPPORTED_DATABASE: &str = "rocksdb";
const SUPPORTED_CONSENSUS: &str = "raft";

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("unsupported state database [{0}], only `{SUPPORTED_DATABASE}` is available")]
    UnsupportedDatabase(String),
    #[error("unsupported consensus algorithm [{0}], only `{SUPPORTED_CONSENSUS}` is available")]
    UnsupportedConsensus(String),
    #[error("node [{0}] is not listed in the bootstrap cluster configuration")]
    NodeNotInCluster(String),
    #[error("node [{node_id}] raft id mismatch: config says {configured}, cluster says {cluster}")]
    RaftIdMismatch { node_id: String, configured: u64, cluster: u64 },
    #[error("invalid cluster configuration: {0}")]
    Cluster(String),
    #[error("queue depths must be positive")]
    EmptyQueue,
    #[error("max transaction count per batch must be positive")]
    EmptyBatch,
}

/// Identity and storage settings of this node.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct NodeIdentityConfig {
    pub id: String,
    pub raft_id: u64,
    pub address: String,
    pub port: u16,
    pub ledger_dir: PathBuf,
    /// Backing database for the state store.
    #[serde(default = "default_database")]
    pub database: String,
    /// Path of the operator key file used to sign query responses.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct QueueConfig {
    #[serde(default = "default_tx_queue")]
    pub transaction: usize,
    #[serde(default = "default_batch_queue")]
    pub transaction_batch: usize,
    #[serde(default = "default_block_queue")]
    pub block: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            transaction: default_tx_queue(),
            transaction_batch: default_batch_queue(),
            block: default_block_queue(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct ConsensusConfig {
    #[serde(default = "default_consensus")]
    pub algorithm: String,
    #[serde(default = "default_max_tx_count")]
    pub max_tx_count_per_batch: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_size: u64,
    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            algorithm: default_consensus(),
            max_tx_count_per_batch: default_max_tx_count(),
            batch_timeout_ms: default_batch_timeout_ms(),
            snapshot_interval_size: default_snapshot_interval(),
            election_timeout_min_ms: default_election_min_ms(),
            election_timeout_max_ms: default_election_max_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
        }
    }
}

impl ConsensusConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// The single structured configuration document of a node. Malformed or
/// inconsistent configuration is fatal at startup.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct LedgerConfig {
    pub node: NodeIdentityConfig,
    /// Bootstrap cluster membership, committed as the genesis block.
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

impl LedgerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: LedgerConfig = serde_json::from_str(&contents)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.node.database != SUPPORTED_DATABASE {
            return Err(ConfigValidationError::UnsupportedDatabase(self.node.database.clone()));
        }
        if self.consensus.algorithm != SUPPORTED_CONSENSUS {
            return Err(ConfigValidationError::UnsupportedConsensus(
                self.consensus.algorithm.clone(),
            ));
        }
        self.cluster.validate().map_err(ConfigValidationError::Cluster)?;
        let Some(own) = self.cluster.node(&self.node.id) else {
            return Err(ConfigValidationError::NodeNotInCluster(self.node.id.clone()));
        };
        if own.raft_id != self.node.raft_id {
            return Err(ConfigValidationError::RaftIdMismatch {
                node_id: self.node.id.clone(),
                configured: self.node.raft_id,
                cluster: own.raft_id,
            });
        }
        if self.queues.transaction == 0
            || self.queues.transaction_batch == 0
            || self.queues.block == 0
        {
            return Err(ConfigValidationError::EmptyQueue);
        }
        if self.consensus.max_tx_count_per_batch == 0 {
            return Err(ConfigValidationError::EmptyBatch);
        }
        Ok(())
    }

    pub fn worldstate_dir(&self) -> PathBuf {
        self.node.ledger_dir.join("worldstate")
    }

    pub fn blockstore_dir(&self) -> PathBuf {
        self.node.ledger_dir.join("blockstore")
    }

    pub fn provenance_dir(&self) -> PathBuf {
        self.node.ledger_dir.join("provenance")
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.node.ledger_dir.join("raft")
    }
}

fn default_database() -> String {
    SUPPORTED_DATABASE.to_string()
}

fn default_consensus() -> String {
    SUPPORTED_CONSENSUS.to_string()
}

fn default_tx_queue() -> usize {
    1000
}

fn default_batch_queue() -> usize {
    100
}

fn default_block_queue() -> usize {
    100
}

fn default_max_tx_count() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    100
}

fn default_snapshot_interval() -> u64 {
    4 << 20
}

fn default_election_min_ms() -> u64 {
    150
}

fn default_election_max_ms() -> u64 {
    300
}

fn default_heartbeat_ms() -> u64 {
    50
}
