use crate::message::RaftMessage;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Message delivery between replication nodes. Sends are fire-and-forget:
/// raft tolerates dropped messages, so an unreachable peer is simply skipped.
/// The production transport is the network layer's concern; tests use
/// [`InProcTransport`].
pub trait Transport: Send + Sync {
    fn send(&self, to: u64, message: RaftMessage);
}

/// Channel-backed transport connecting nodes within one process. Nodes can be
/// disconnected and reconnected to simulate partitions and crashes.
#[derive(Default)]
pub struct InProcTransport {
    inboxes: Mutex<HashMap<u64, Sender<RaftMessage>>>,
    disconnected: Mutex<HashSet<u64>>,
}

impl InProcTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(InProcTransport::default())
    }

    /// Registers a node and returns the receiving end of its inbox.
    pub fn register(&self, node_id: u64) -> Receiver<RaftMessage> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.inboxes.lock().insert(node_id, sender);
        receiver
    }

    /// Drops all traffic from and to the node until [`Self::reconnect`].
    pub fn disconnect(&self, node_id: u64) {
        self.disconnected.lock().insert(node_id);
    }

    pub fn reconnect(&self, node_id: u64) {
        self.disconnected.lock().remove(&node_id);
    }

    fn is_disconnected(&self, node_id: u64) -> bool {
        self.disconnected.lock().contains(&node_id)
    }
}

impl Transport for InProcTransport {
    fn send(&self, to: u64, message: RaftMessage) {
        let from_disconnected = match &message {
            RaftMessage::BlockRequest { from, .. } | RaftMessage::BlockResponse { from, .. } => {
                self.is_disconnected(*from)
            }
            RaftMessage::AppendEntries { leader_id, .. }
            | RaftMessage::InstallSnapshot { leader_id, .. } => self.is_disconnected(*leader_id),
            RaftMessage::RequestVote { candidate_id, .. } => self.is_disconnected(*candidate_id),
            RaftMessage::RequestVoteResponse { from, .. }
            | RaftMessage::AppendEntriesResponse { from, .. }
            | RaftMessage::InstallSnapshotResponse { from, .. } => self.is_disconnected(*from),
        };
        if from_disconnected || self.is_disconnected(to) {
            trace!(target: "replication", to, "dropping message to disconnected node");
            return;
        }
        if let Some(sender) = self.inboxes.lock().get(&to) {
            // A full or closed inbox behaves like a lost message.
            let _ = sender.send(message);
        }
    }
}
