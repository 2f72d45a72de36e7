#![allow(dead_code)]

use ledger_crypto::InMemorySigner;
use ledger_primitives::cluster::{Admin, ClusterConfig, NodeConfig};
use ledger_primitives::transaction::{
    canonical_bytes, DataTx, DataTxEnvelope, DataWrite, DbOperation, Transaction, UserAdminTx,
    UserAdminTxEnvelope, UserWrite,
};
use ledger_primitives::types::{Access, Privilege, User, DEFAULT_DB};
use ledger_processor::SubmitOutcome;
use ledger_replication::{InProcTransport, Transport};
use ledgerdb::config::{ConsensusConfig, LedgerConfig, NodeIdentityConfig, QueueConfig};
use ledgerdb::{LedgerNode, Submitter};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const ADMIN: &str = "admin";
pub const TEST_USER: &str = "testUser";

pub fn admin_signer() -> InMemorySigner {
    InMemorySigner::from_seed(ADMIN, ADMIN)
}

pub fn user_signer() -> InMemorySigner {
    InMemorySigner::from_seed(TEST_USER, TEST_USER)
}

pub fn cluster_config(node_count: u64) -> ClusterConfig {
    ClusterConfig {
        nodes: (1..=node_count)
            .map(|raft_id| NodeConfig {
                id: format!("node{raft_id}"),
                raft_id,
                address: "127.0.0.1".to_string(),
                port: 7050 + raft_id as u16,
                verifying_key: InMemorySigner::from_seed(
                    &format!("node{raft_id}"),
                    &format!("node{raft_id}"),
                )
                .public_key,
            })
            .collect(),
        admins: vec![Admin { id: ADMIN.to_string(), verifying_key: admin_signer().public_key }],
    }
}

pub fn node_config(dir: &Path, raft_id: u64, node_count: u64) -> LedgerConfig {
    LedgerConfig {
        node: NodeIdentityConfig {
            id: format!("node{raft_id}"),
            raft_id,
            address: "127.0.0.1".to_string(),
            port: 7050 + raft_id as u16,
            ledger_dir: dir.join(format!("node{raft_id}")),
            database: "rocksdb".to_string(),
            key_path: None,
        },
        cluster: cluster_config(node_count),
        queues: QueueConfig::default(),
        consensus: ConsensusConfig {
            max_tx_count_per_batch: 1,
            batch_timeout_ms: 50,
            ..Default::default()
        },
    }
}

pub fn open_node(
    dir: &Path,
    raft_id: u64,
    node_count: u64,
    transport: &Arc<InProcTransport>,
) -> LedgerNode {
    let config = node_config(dir, raft_id, node_count);
    let inbox = transport.register(raft_id);
    let signer =
        InMemorySigner::from_seed(&config.node.id, &config.node.id.clone());
    LedgerNode::open(
        config,
        signer,
        Arc::clone(transport) as Arc<dyn Transport>,
        inbox,
    )
    .unwrap()
}

/// Single node, booted to genesis, with `testUser` registered through a user
/// administration block holding read-write access to the default database.
pub fn boot_single_node(dir: &Path, transport: &Arc<InProcTransport>) -> LedgerNode {
    let node = open_node(dir, 1, 1, transport);
    node.bootstrap(Duration::from_secs(30)).unwrap();
    register_test_user(&node, DEFAULT_DB);
    node
}

pub fn register_test_user(node: &LedgerNode, db_name: &str) {
    register_user(node, &user_signer(), &[(db_name, Access::ReadWrite)]);
}

pub fn register_user(node: &LedgerNode, signer: &InMemorySigner, grants: &[(&str, Access)]) {
    let user = User {
        id: signer.id.clone(),
        verifying_key: signer.public_key,
        privilege: Privilege {
            db_permission: grants
                .iter()
                .map(|(db, access)| (db.to_string(), *access))
                .collect(),
            admin: false,
        },
    };
    let payload = UserAdminTx {
        user_id: ADMIN.to_string(),
        tx_id: format!("register-{}-{:08x}", signer.id, rand_nonce()),
        user_writes: vec![UserWrite { user, acl: None }],
        user_deletes: vec![],
    };
    let signature = admin_signer().sign(&canonical_bytes(&payload)).to_vec();
    let outcome = node
        .submit_transaction(
            Transaction::UserAdmin(UserAdminTxEnvelope { payload, signature }),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Receipt(_)));
}

pub fn signed_data_tx(tx_id: &str, ops: Vec<DbOperation>) -> Transaction {
    let signer = user_signer();
    let payload = DataTx {
        must_sign_user_ids: vec![signer.id.clone()],
        tx_id: tx_id.to_string(),
        db_operations: ops,
    };
    let signature = signer.sign(&canonical_bytes(&payload)).to_vec();
    Transaction::Data(DataTxEnvelope {
        payload,
        signatures: BTreeMap::from([(signer.id.clone(), signature)]),
    })
}

pub fn write_op(db_name: &str, key: &str, value: &[u8]) -> DbOperation {
    DbOperation {
        db_name: db_name.to_string(),
        reads: vec![],
        writes: vec![DataWrite { key: key.to_string(), value: value.to_vec(), acl: None }],
        deletes: vec![],
    }
}

/// Commits one data block writing a single key and waits for the receipt.
pub fn commit_data_block(node: &LedgerNode, tx_id: &str, key: &str, value: &[u8]) {
    let tx = signed_data_tx(tx_id, vec![write_op(DEFAULT_DB, key, value)]);
    let outcome = node.submit_transaction(tx, Some(Duration::from_secs(10))).unwrap();
    assert!(matches!(outcome, SubmitOutcome::Receipt(_)), "tx {tx_id} did not commit");
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn rand_nonce() -> u32 {
    rand::random()
}
