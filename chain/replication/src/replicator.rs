use crate::message::RaftMessage;
use crate::raft::RaftNode;
use crate::transport::Transport;
use crossbeam_channel::{Receiver, Sender};
use ledger_primitives::block::Block;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Raised when a submission lands on a non-leader node. `leader_id` is 0 and
/// the address empty while no leader is known.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a leader, leader is node [{leader_id}] at [{leader_host_port}]")]
pub struct NotLeaderError {
    pub leader_id: u64,
    pub leader_host_port: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("replication io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node [{node_id}] is not a member of the configured cluster")]
    UnknownNode { node_id: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    pub raft_id: u64,
    pub host_port: String,
}

#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    pub node_id: u64,
    /// Every cluster member, including this node.
    pub peers: Vec<PeerConfig>,
    pub raft_dir: PathBuf,
    /// Snapshot is taken once the raft log exceeds this many bytes.
    pub snapshot_interval_size: u64,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub committed_queue_depth: usize,
}

impl ReplicationConfig {
    pub fn new(node_id: u64, peers: Vec<PeerConfig>, raft_dir: PathBuf) -> Self {
        ReplicationConfig {
            node_id,
            peers,
            raft_dir,
            snapshot_interval_size: 4 << 20,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            committed_queue_depth: 100,
        }
    }
}

/// Read access to the local ledger, used to serve catch-up requests from
/// peers and to resume from the right position after a restart.
pub trait LedgerAccess: Send + Sync {
    fn height(&self) -> u64;
    fn block(&self, block_num: u64) -> Option<Block>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Follower,
    Candidate,
    Leader,
}

pub(crate) struct Status {
    pub(crate) role: Role,
    pub(crate) term: u64,
    pub(crate) leader_id: u64,
}

/// Consensus adapter: submits blocks on the leader, delivers committed blocks
/// in the same total order on every node, and hands back proposals that can
/// no longer commit after a leadership change.
pub struct BlockReplicator {
    node_id: u64,
    peers: Vec<PeerConfig>,
    status: Arc<RwLock<Status>>,
    proposal_tx: Sender<Block>,
    committed_rx: Receiver<Block>,
    dropped_rx: Receiver<Block>,
    shutdown_tx: Sender<()>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BlockReplicator {
    /// Builds the replication node and starts its worker thread. `inbox` is
    /// this node's receiving end registered with the transport.
    pub fn start(
        config: ReplicationConfig,
        transport: Arc<dyn Transport>,
        inbox: Receiver<RaftMessage>,
        ledger: Arc<dyn LedgerAccess>,
    ) -> Result<Self, ReplicationError> {
        if !config.peers.iter().any(|peer| peer.raft_id == config.node_id) {
            return Err(ReplicationError::UnknownNode { node_id: config.node_id });
        }
        let status = Arc::new(RwLock::new(Status {
            role: Role::Follower,
            term: 0,
            leader_id: 0,
        }));
        let (proposal_tx, proposal_rx) = crossbeam_channel::bounded(config.committed_queue_depth);
        let (committed_tx, committed_rx) =
            crossbeam_channel::bounded(config.committed_queue_depth);
        let (dropped_tx, dropped_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let node_id = config.node_id;
        let peers = config.peers.clone();
        let node = RaftNode::new(
            config,
            transport,
            ledger,
            Arc::clone(&status),
            committed_tx,
            dropped_tx,
        )?;
        let handle = std::thread::Builder::new()
            .name(format!("raft-{node_id}"))
            .spawn(move || node.run(inbox, proposal_rx, shutdown_rx))
            .expect("spawning the raft thread should not fail");

        info!(target: "replication", node_id, "block replicator started");
        Ok(BlockReplicator {
            node_id,
            peers,
            status,
            proposal_tx,
            committed_rx,
            dropped_rx,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Ok when this node currently believes it is the leader; the error
    /// carries the known leader's identity otherwise.
    pub fn is_leader(&self) -> Result<(), NotLeaderError> {
        let status = self.status.read();
        if status.role == Role::Leader {
            Ok(())
        } else {
            Err(self.not_leader_error(status.leader_id))
        }
    }

    fn not_leader_error(&self, leader_id: u64) -> NotLeaderError {
        let leader_host_port = self
            .peers
            .iter()
            .find(|peer| peer.raft_id == leader_id)
            .map(|peer| peer.host_port.clone())
            .unwrap_or_default();
        NotLeaderError { leader_id, leader_host_port }
    }

    /// Proposes a block for replication. Leader-only: followers fail fast
    /// with the leader's address. A proposal racing a leadership change is
    /// returned through [`Self::dropped_blocks`].
    pub fn submit(&self, block: Block) -> Result<(), NotLeaderError> {
        self.is_leader()?;
        // A send failure means the raft thread is gone; the caller observes
        // shutdown through the promise drain.
        let _ = self.proposal_tx.send(block);
        Ok(())
    }

    /// Ordered stream of committed blocks, identical on every node.
    pub fn committed_blocks(&self) -> Receiver<Block> {
        self.committed_rx.clone()
    }

    /// Proposed blocks that can no longer commit, typically because
    /// leadership moved. The transaction processor releases their pending
    /// promises with a not-leader error.
    pub fn dropped_blocks(&self) -> Receiver<Block> {
        self.dropped_rx.clone()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        info!(target: "replication", node_id = self.node_id, "block replicator closed");
    }
}

impl Drop for BlockReplicator {
    fn drop(&mut self) {
        self.close();
    }
}
