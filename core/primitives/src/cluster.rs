use borsh::{BorshDeserialize, BorshSerialize};
use ledger_crypto::PublicKey;
use std::collections::BTreeSet;

/// A member node of the cluster as recorded in the committed configuration.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
pub struct NodeConfig {
    pub id: String,
    /// Identifier used by the replication layer. Must be non-zero: zero is
    /// reserved for "leader unknown" in not-leader errors.
    pub raft_id: u64,
    pub address: String,
    pub port: u16,
    pub verifying_key: PublicKey,
}

impl NodeConfig {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
pub struct Admin {
    pub id: String,
    pub verifying_key: PublicKey,
}

/// Cluster configuration committed to the ledger through config transactions.
/// Block 1 (genesis) carries the bootstrap instance.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Default,
)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    pub admins: Vec<Admin>,
}

impl ClusterConfig {
    /// Schema validation applied to every config transaction, including the
    /// self-produced genesis block.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("cluster config must list at least one node".to_string());
        }
        if self.admins.is_empty() {
            return Err("cluster config must list at least one admin".to_string());
        }
        let mut node_ids = BTreeSet::new();
        let mut raft_ids = BTreeSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err("node id must not be empty".to_string());
            }
            if node.raft_id == 0 {
                return Err(format!("node [{}] has reserved raft id 0", node.id));
            }
            if !node_ids.insert(&node.id) {
                return Err(format!("duplicate node id [{}]", node.id));
            }
            if !raft_ids.insert(node.raft_id) {
                return Err(format!("duplicate raft id [{}]", node.raft_id));
            }
        }
        let mut admin_ids = BTreeSet::new();
        for admin in &self.admins {
            if admin.id.is_empty() {
                return Err("admin id must not be empty".to_string());
            }
            if !admin_ids.insert(&admin.id) {
                return Err(format!("duplicate admin id [{}]", admin.id));
            }
        }
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    pub fn node_by_raft_id(&self, raft_id: u64) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.raft_id == raft_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_crypto::SecretKey;

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            nodes: vec![NodeConfig {
                id: "node1".to_string(),
                raft_id: 1,
                address: "127.0.0.1".to_string(),
                port: 7050,
                verifying_key: SecretKey::from_seed("node1").public_key(),
            }],
            admins: vec![Admin {
                id: "admin".to_string(),
                verifying_key: SecretKey::from_seed("admin").public_key(),
            }],
        }
    }

    #[test]
    fn valid_config_passes() {
        assert_eq!(test_config().validate(), Ok(()));
    }

    #[test]
    fn rejects_empty_and_duplicates() {
        let mut config = test_config();
        config.admins.clear();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.nodes.push(config.nodes[0].clone());
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.nodes[0].raft_id = 0;
        assert!(config.validate().is_err());
    }
}
