use ledger_primitives::types::DEFAULT_DB;
use ledger_processor::TxError;
use ledger_replication::InProcTransport;
use ledgerdb::testonly::init_test_logger;
use ledgerdb::{LedgerNode, Submitter};
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::*;

fn wait_for_leader(nodes: &[Arc<LedgerNode>]) -> usize {
    let mut leader = None;
    assert!(
        wait_until(Duration::from_secs(30), || {
            leader = nodes.iter().position(|node| node.is_leader().is_ok());
            leader.is_some()
        }),
        "no leader elected within 30s"
    );
    leader.unwrap()
}

#[test]
fn three_node_cluster_replicates_the_ledger() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let transport = InProcTransport::new();

    let nodes: Vec<Arc<LedgerNode>> =
        (1..=3).map(|raft_id| Arc::new(open_node(dir.path(), raft_id, 3, &transport))).collect();

    // Whoever wins the election commits genesis; the others receive it.
    let bootstrappers: Vec<_> = nodes
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            std::thread::spawn(move || node.bootstrap(Duration::from_secs(60)).unwrap())
        })
        .collect();
    for handle in bootstrappers {
        handle.join().unwrap();
    }

    let leader = wait_for_leader(&nodes);
    register_test_user(&nodes[leader], DEFAULT_DB);
    for i in 0..10 {
        commit_data_block(&nodes[leader], &format!("tx{i}"), &format!("key{i}"), b"value");
    }
    // Genesis, the registration block and ten data blocks; an extra block
    // can appear if two bootstrap attempts raced during the first election.
    let target_height = nodes[leader].ledger_height();
    assert!(target_height >= 12, "unexpected height {target_height}");

    // Every ledger converges block for block.
    assert!(
        wait_until(Duration::from_secs(30), || nodes
            .iter()
            .all(|node| node.ledger_height() == target_height)),
        "followers did not catch up"
    );
    for num in 1..=target_height {
        let reference = nodes[leader].block_store().get(num).unwrap();
        for node in &nodes {
            assert_eq!(node.block_store().get(num).unwrap(), reference, "block {num}");
        }
    }
    // State converges too: the same key is visible everywhere.
    assert!(wait_until(Duration::from_secs(10), || nodes.iter().all(|node| {
        node.state().get(DEFAULT_DB, "key9").map(|record| record.is_some()).unwrap_or(false)
    })));

    // Submitting to a follower redirects to the leader.
    let follower = (0..3).find(|index| *index != leader).unwrap();
    let err = nodes[follower]
        .submit_transaction(
            signed_data_tx("follower-tx", vec![write_op(DEFAULT_DB, "k", b"v")]),
            Some(Duration::from_secs(5)),
        )
        .unwrap_err();
    let TxError::NotLeader(not_leader) = err else {
        panic!("expected a not-leader error, got {err:?}");
    };
    assert_eq!(not_leader.leader_id, (leader + 1) as u64);
    assert!(!not_leader.leader_host_port.is_empty());

    for node in &nodes {
        node.close();
    }
}
