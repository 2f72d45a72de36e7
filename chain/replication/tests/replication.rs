use assert_matches::assert_matches;
use ledger_primitives::block::{Block, BlockHeader, BlockHeaderBase, BlockPayload};
use ledger_primitives::transaction::{DataTx, DataTxEnvelope};
use ledger_primitives::validation::ValidationInfo;
use ledger_replication::{
    BlockReplicator, InProcTransport, LedgerAccess, NotLeaderError, PeerConfig,
    ReplicationConfig,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Stand-in for the block store plus committer: drains the committed channel
/// into an in-memory chain.
#[derive(Default)]
struct TestLedger {
    blocks: RwLock<Vec<Block>>,
}

impl LedgerAccess for TestLedger {
    fn height(&self) -> u64 {
        self.blocks.read().unwrap().len() as u64
    }

    fn block(&self, block_num: u64) -> Option<Block> {
        self.blocks.read().unwrap().get(block_num.checked_sub(1)? as usize).cloned()
    }
}

struct TestNode {
    id: u64,
    replicator: Arc<BlockReplicator>,
    ledger: Arc<TestLedger>,
}

fn start_cluster(
    count: u64,
    dir: &Path,
    transport: &Arc<InProcTransport>,
    snapshot_interval_size: u64,
) -> Vec<TestNode> {
    let peers: Vec<PeerConfig> = (1..=count)
        .map(|raft_id| PeerConfig {
            raft_id,
            host_port: format!("127.0.0.1:{}", 7050 + raft_id),
        })
        .collect();
    (1..=count)
        .map(|id| start_node(id, peers.clone(), dir, transport, snapshot_interval_size))
        .collect()
}

fn start_node(
    id: u64,
    peers: Vec<PeerConfig>,
    dir: &Path,
    transport: &Arc<InProcTransport>,
    snapshot_interval_size: u64,
) -> TestNode {
    let ledger = Arc::new(TestLedger::default());
    let inbox = transport.register(id);
    let mut config =
        ReplicationConfig::new(id, peers, dir.join(format!("node{id}")).join("raft"));
    config.snapshot_interval_size = snapshot_interval_size;
    let replicator = Arc::new(
        BlockReplicator::start(
            config,
            Arc::clone(transport) as Arc<dyn ledger_replication::Transport>,
            inbox,
            Arc::clone(&ledger) as Arc<dyn LedgerAccess>,
        )
        .unwrap(),
    );

    // Committer stand-in: append each delivered block to the chain in order.
    let committed = replicator.committed_blocks();
    let drain_ledger = Arc::clone(&ledger);
    std::thread::spawn(move || {
        while let Ok(block) = committed.recv() {
            let mut blocks = drain_ledger.blocks.write().unwrap();
            if block.number() == blocks.len() as u64 + 1 {
                blocks.push(block);
            }
        }
    });
    TestNode { id, replicator, ledger }
}

fn make_block(number: u64) -> Block {
    let envelope = DataTxEnvelope {
        payload: DataTx {
            must_sign_user_ids: vec!["testUser".to_string()],
            tx_id: format!("tx-{number}"),
            db_operations: vec![],
        },
        signatures: BTreeMap::new(),
    };
    Block {
        header: BlockHeader {
            base_header: BlockHeaderBase { number, ..Default::default() },
            skipchain_hashes: vec![],
            tx_merkle_root: Default::default(),
            validation_info: vec![ValidationInfo::valid()],
        },
        payload: BlockPayload::DataTxs(vec![envelope]),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Index of the current leader among `eligible` node positions.
fn wait_for_leader(nodes: &[TestNode], eligible: &[usize]) -> usize {
    let mut found = None;
    assert!(
        wait_until(Duration::from_secs(30), || {
            found = eligible
                .iter()
                .copied()
                .find(|index| nodes[*index].replicator.is_leader().is_ok());
            found.is_some()
        }),
        "no leader elected within 30s"
    );
    found.unwrap()
}

/// Submits blocks one at a time, each after the previous one committed, the
/// way the proposer serializes proposals on commit.
fn submit_blocks(node: &TestNode, count: u64) {
    for _ in 0..count {
        let number = node.ledger.height() + 1;
        node.replicator.submit(make_block(number)).unwrap();
        assert!(
            wait_until(Duration::from_secs(10), || node.ledger.height() >= number),
            "block {number} did not commit"
        );
    }
}

#[test]
fn three_nodes_elect_and_replicate() {
    let dir = tempfile::tempdir().unwrap();
    let transport = InProcTransport::new();
    let nodes = start_cluster(3, dir.path(), &transport, 4 << 20);

    let leader = wait_for_leader(&nodes, &[0, 1, 2]);
    submit_blocks(&nodes[leader], 100);

    assert!(wait_until(Duration::from_secs(30), || nodes
        .iter()
        .all(|node| node.ledger.height() == 100)));
    // Ledgers agree block for block.
    let reference: Vec<_> = (1..=100).map(|num| nodes[0].ledger.block(num).unwrap()).collect();
    for node in &nodes[1..] {
        for block in &reference {
            assert_eq!(node.ledger.block(block.number()).unwrap(), *block);
        }
    }
    for node in &nodes {
        node.replicator.close();
    }
}

#[test]
fn submissions_on_a_follower_fail_with_the_leader_address() {
    let dir = tempfile::tempdir().unwrap();
    let transport = InProcTransport::new();
    let nodes = start_cluster(3, dir.path(), &transport, 4 << 20);

    let leader = wait_for_leader(&nodes, &[0, 1, 2]);
    let follower = (0..3).find(|index| *index != leader).unwrap();
    // The follower may learn the leader with a small delay.
    assert!(wait_until(Duration::from_secs(10), || matches!(
        nodes[follower].replicator.is_leader(),
        Err(NotLeaderError { leader_id, .. }) if leader_id == nodes[leader].id
    )));
    let err = nodes[follower].replicator.submit(make_block(1)).unwrap_err();
    assert_eq!(err.leader_id, nodes[leader].id);
    assert_eq!(err.leader_host_port, format!("127.0.0.1:{}", 7050 + nodes[leader].id));
    for node in &nodes {
        node.replicator.close();
    }
}

#[test]
fn leader_failover_elects_a_new_leader() {
    let dir = tempfile::tempdir().unwrap();
    let transport = InProcTransport::new();
    let nodes = start_cluster(3, dir.path(), &transport, 4 << 20);

    let first = wait_for_leader(&nodes, &[0, 1, 2]);
    submit_blocks(&nodes[first], 5);

    transport.disconnect(nodes[first].id);
    let survivors: Vec<usize> = (0..3).filter(|index| *index != first).collect();
    let second = wait_for_leader(&nodes, &survivors);
    assert_ne!(first, second);

    submit_blocks(&nodes[second], 5);
    assert!(wait_until(Duration::from_secs(10), || survivors
        .iter()
        .all(|index| nodes[*index].ledger.height() == 10)));
    for node in &nodes {
        node.replicator.close();
    }
}

#[test]
fn quorum_loss_drains_in_flight_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let transport = InProcTransport::new();
    let nodes = start_cluster(3, dir.path(), &transport, 4 << 20);

    let leader = wait_for_leader(&nodes, &[0, 1, 2]);
    submit_blocks(&nodes[leader], 3);

    // Cut the leader off from both followers, then push one more block in.
    for node in &nodes {
        if node.id != nodes[leader].id {
            transport.disconnect(node.id);
        }
    }
    let dropped = nodes[leader].replicator.dropped_blocks();
    nodes[leader].replicator.submit(make_block(4)).unwrap();

    // Check-quorum steps the leader down and hands the proposal back.
    let drained = dropped.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(drained.number(), 4);
    assert_matches!(nodes[leader].replicator.is_leader(), Err(NotLeaderError { .. }));
    assert_eq!(nodes[leader].ledger.height(), 3);
    for node in &nodes {
        node.replicator.close();
    }
}

#[test]
fn lagging_follower_catches_up_through_snapshot_reference() {
    let dir = tempfile::tempdir().unwrap();
    let transport = InProcTransport::new();
    // Tiny snapshot interval so the log compacts while the follower is away.
    let nodes = start_cluster(3, dir.path(), &transport, 1024);

    let leader = wait_for_leader(&nodes, &[0, 1, 2]);
    let lagging = (0..3).find(|index| *index != leader).unwrap();
    transport.disconnect(nodes[lagging].id);

    submit_blocks(&nodes[leader], 30);
    transport.reconnect(nodes[lagging].id);

    assert!(
        wait_until(Duration::from_secs(30), || nodes[lagging].ledger.height() == 30),
        "lagging follower did not catch up, height {}",
        nodes[lagging].ledger.height()
    );
    for num in 1..=30 {
        assert_eq!(
            nodes[lagging].ledger.block(num).unwrap(),
            nodes[leader].ledger.block(num).unwrap()
        );
    }
    for node in &nodes {
        node.replicator.close();
    }
}

#[test]
fn single_node_restart_resumes_without_redelivery() {
    let dir = tempfile::tempdir().unwrap();
    let transport = InProcTransport::new();
    let peers = vec![PeerConfig { raft_id: 1, host_port: "127.0.0.1:7051".to_string() }];

    let node = start_node(1, peers.clone(), dir.path(), &transport, 4 << 20);
    wait_for_leader(std::slice::from_ref(&node), &[0]);
    submit_blocks(&node, 3);
    let blocks: Vec<_> = (1..=3).map(|num| node.ledger.block(num).unwrap()).collect();
    node.replicator.close();

    // Same wal directory, ledger restored from "disk".
    let transport = InProcTransport::new();
    let restarted = start_node(1, peers, dir.path(), &transport, 4 << 20);
    for block in &blocks {
        restarted.ledger.blocks.write().unwrap().push(block.clone());
    }
    wait_for_leader(std::slice::from_ref(&restarted), &[0]);

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(restarted.ledger.height(), 3);
    submit_blocks(&restarted, 1);
    assert_eq!(restarted.ledger.height(), 4);
    restarted.replicator.close();
}
