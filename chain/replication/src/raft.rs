use crate::message::{LogEntry, RaftMessage};
use crate::replicator::{LedgerAccess, ReplicationConfig, ReplicationError, Role, Status};
use crate::storage::{HardState, RaftStorage, Snapshot};
use crate::transport::Transport;
use crossbeam_channel::{Receiver, Sender};
use ledger_primitives::block::Block;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Entries shipped per AppendEntries message and blocks served per catch-up
/// response.
const MAX_BATCH: usize = 32;

struct CatchupState {
    target_height: u64,
    last_term: u64,
    leader_id: u64,
}

pub(crate) struct RaftNode {
    id: u64,
    peer_ids: Vec<u64>,
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn LedgerAccess>,
    storage: RaftStorage,
    hard_state: HardState,
    snapshot: Snapshot,
    /// Entries with index > snapshot.last_index.
    log: Vec<LogEntry>,
    role: Role,
    leader_id: u64,
    commit_index: u64,
    last_applied: u64,
    next_index: HashMap<u64, u64>,
    match_index: HashMap<u64, u64>,
    votes: HashSet<u64>,
    /// Uncommitted indexes proposed by this node while leader. Returned
    /// through `dropped_tx` when leadership is lost.
    own_proposals: HashSet<u64>,
    last_contact: HashMap<u64, Instant>,
    status: Arc<RwLock<Status>>,
    committed_tx: Sender<Block>,
    dropped_tx: Sender<Block>,
    catchup: Option<CatchupState>,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    heartbeat_interval: Duration,
    snapshot_interval_size: u64,
}

impl RaftNode {
    pub(crate) fn new(
        config: ReplicationConfig,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn LedgerAccess>,
        status: Arc<RwLock<Status>>,
        committed_tx: Sender<Block>,
        dropped_tx: Sender<Block>,
    ) -> Result<Self, ReplicationError> {
        let (storage, hard_state, snapshot, log) = RaftStorage::open(&config.raft_dir)?;
        let peer_ids = config
            .peers
            .iter()
            .map(|peer| peer.raft_id)
            .filter(|raft_id| *raft_id != config.node_id)
            .collect();

        // Blocks already in the local ledger were applied before the restart;
        // delivery resumes right after them.
        let last_applied = ledger.height().max(snapshot.last_index);
        let commit_index = last_applied;
        status.write().term = hard_state.term;

        let now = Instant::now();
        let mut node = RaftNode {
            id: config.node_id,
            peer_ids,
            transport,
            ledger,
            storage,
            hard_state,
            snapshot,
            log,
            role: Role::Follower,
            leader_id: 0,
            commit_index,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            own_proposals: HashSet::new(),
            last_contact: HashMap::new(),
            status,
            committed_tx,
            dropped_tx,
            catchup: None,
            election_deadline: now,
            heartbeat_deadline: now,
            election_timeout_min: config.election_timeout_min,
            election_timeout_max: config.election_timeout_max,
            heartbeat_interval: config.heartbeat_interval,
            snapshot_interval_size: config.snapshot_interval_size,
        };
        node.reset_election_deadline();
        Ok(node)
    }

    pub(crate) fn run(
        mut self,
        inbox: Receiver<RaftMessage>,
        proposals: Receiver<Block>,
        shutdown: Receiver<()>,
    ) {
        loop {
            let deadline = match self.role {
                Role::Leader => self.heartbeat_deadline,
                _ => self.election_deadline,
            };
            let timeout = deadline.saturating_duration_since(Instant::now());
            crossbeam_channel::select! {
                recv(inbox) -> message => match message {
                    Ok(message) => self.handle_message(message),
                    Err(_) => return,
                },
                recv(proposals) -> block => {
                    if let Ok(block) = block {
                        self.handle_proposal(block);
                    }
                }
                recv(shutdown) -> _ => {
                    self.drain_own_proposals();
                    return;
                }
                default(timeout) => self.handle_timeout(),
            }
        }
    }

    fn total_nodes(&self) -> usize {
        self.peer_ids.len() + 1
    }

    fn majority(&self) -> usize {
        self.total_nodes() / 2 + 1
    }

    fn last_log_index(&self) -> u64 {
        self.snapshot.last_index + self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|entry| entry.term).unwrap_or(self.snapshot.last_term)
    }

    /// Term of the entry at `index`. Indexes at or below the snapshot point
    /// resolve to the snapshot term; index 0 is term 0.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index <= self.snapshot.last_index {
            return (index == self.snapshot.last_index).then_some(self.snapshot.last_term);
        }
        self.log.get((index - self.snapshot.last_index - 1) as usize).map(|entry| entry.term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot.last_index {
            return None;
        }
        self.log.get((index - self.snapshot.last_index - 1) as usize)
    }

    fn reset_election_deadline(&mut self) {
        let spread = self
            .election_timeout_max
            .saturating_sub(self.election_timeout_min)
            .as_millis()
            .max(1) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..spread));
        self.election_deadline = Instant::now() + self.election_timeout_min + jitter;
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.role = self.role;
        status.term = self.hard_state.term;
        status.leader_id = self.leader_id;
    }

    fn persist_hard_state(&self) {
        if let Err(err) = self.storage.persist_hard_state(&self.hard_state) {
            // Losing durable term/vote would violate election safety across a
            // restart; there is no way to continue.
            panic!("failed to persist raft hard state: {err}");
        }
    }

    fn handle_timeout(&mut self) {
        match self.role {
            Role::Leader => {
                if !self.has_quorum_contact() {
                    info!(target: "replication", id = self.id, term = self.hard_state.term,
                          "lost contact with a quorum, stepping down");
                    self.step_down(self.hard_state.term, 0);
                    return;
                }
                self.broadcast_append_entries();
                self.heartbeat_deadline = Instant::now() + self.heartbeat_interval;
            }
            Role::Follower | Role::Candidate => self.start_election(),
        }
    }

    /// Check-quorum: a leader partitioned away from a majority steps down
    /// after an election timeout, so stalled submissions fail fast with a
    /// not-leader error instead of hanging until a new term reaches it.
    fn has_quorum_contact(&self) -> bool {
        let horizon = Instant::now() - self.election_timeout_max;
        let reachable = 1 + self
            .peer_ids
            .iter()
            .filter(|peer| {
                self.last_contact.get(peer).is_some_and(|instant| *instant > horizon)
            })
            .count();
        reachable >= self.majority()
    }

    fn start_election(&mut self) {
        self.hard_state.term += 1;
        self.hard_state.voted_for = self.id;
        self.persist_hard_state();
        self.role = Role::Candidate;
        self.leader_id = 0;
        self.votes = HashSet::from([self.id]);
        self.reset_election_deadline();
        self.publish_status();
        debug!(target: "replication", id = self.id, term = self.hard_state.term, "starting election");

        if self.votes.len() >= self.majority() {
            self.become_leader();
            return;
        }
        for peer in &self.peer_ids {
            self.transport.send(
                *peer,
                RaftMessage::RequestVote {
                    term: self.hard_state.term,
                    candidate_id: self.id,
                    last_log_index: self.last_log_index(),
                    last_log_term: self.last_log_term(),
                },
            );
        }
    }

    fn become_leader(&mut self) {
        info!(target: "replication", id = self.id, term = self.hard_state.term, "became leader");
        self.role = Role::Leader;
        self.leader_id = self.id;
        let next = self.last_log_index() + 1;
        self.next_index = self.peer_ids.iter().map(|peer| (*peer, next)).collect();
        self.match_index = self.peer_ids.iter().map(|peer| (*peer, 0)).collect();
        self.last_contact =
            self.peer_ids.iter().map(|peer| (*peer, Instant::now())).collect();
        self.publish_status();
        self.broadcast_append_entries();
        self.heartbeat_deadline = Instant::now() + self.heartbeat_interval;
    }

    fn step_down(&mut self, term: u64, leader_id: u64) {
        let was_leader = self.role == Role::Leader;
        if term > self.hard_state.term {
            self.hard_state.term = term;
            self.hard_state.voted_for = 0;
            self.persist_hard_state();
        }
        self.role = Role::Follower;
        self.leader_id = leader_id;
        self.votes.clear();
        self.reset_election_deadline();
        self.publish_status();
        if was_leader {
            self.drain_own_proposals();
        }
    }

    /// Returns the blocks of uncommitted self-proposed entries so their
    /// pending promises resolve with a not-leader error. Should one of them
    /// still commit under a later leader, the commit path simply finds no
    /// promise left to resolve.
    fn drain_own_proposals(&mut self) {
        let own = std::mem::take(&mut self.own_proposals);
        let mut dropped: Vec<u64> =
            own.into_iter().filter(|index| *index > self.commit_index).collect();
        dropped.sort_unstable();
        for index in dropped {
            if let Some(entry) = self.entry_at(index) {
                let _ = self.dropped_tx.send(entry.block.clone());
            }
        }
    }

    fn handle_proposal(&mut self, block: Block) {
        if self.role != Role::Leader {
            let _ = self.dropped_tx.send(block);
            return;
        }
        let index = self.last_log_index() + 1;
        if block.number() != index {
            // The proposer raced a leadership or commit change; hand the
            // block back rather than replicate a hole.
            warn!(target: "replication", id = self.id, block_num = block.number(), index,
                  "dropping proposal out of line with the replicated log");
            let _ = self.dropped_tx.send(block);
            return;
        }
        let entry = LogEntry { index, term: self.hard_state.term, block };
        if let Err(err) = self.storage.append_entry(&entry) {
            panic!("failed to append to the raft log: {err}");
        }
        self.log.push(entry);
        self.own_proposals.insert(index);
        debug!(target: "replication", id = self.id, index, "appended proposal");
        self.broadcast_append_entries();
        self.advance_commit();
    }

    fn broadcast_append_entries(&mut self) {
        for peer in self.peer_ids.clone() {
            self.send_append_entries(peer);
        }
    }

    fn send_append_entries(&mut self, peer: u64) {
        let next = *self.next_index.get(&peer).unwrap_or(&1);
        if next <= self.snapshot.last_index {
            self.transport.send(
                peer,
                RaftMessage::InstallSnapshot {
                    term: self.hard_state.term,
                    leader_id: self.id,
                    last_index: self.snapshot.last_index,
                    last_term: self.snapshot.last_term,
                    ledger_height: self.snapshot.ledger_height,
                },
            );
            return;
        }
        let prev_log_index = next - 1;
        let Some(prev_log_term) = self.term_at(prev_log_index) else {
            return;
        };
        let entries: Vec<LogEntry> = (next..=self.last_log_index())
            .take(MAX_BATCH)
            .filter_map(|index| self.entry_at(index).cloned())
            .collect();
        self.transport.send(
            peer,
            RaftMessage::AppendEntries {
                term: self.hard_state.term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    fn handle_message(&mut self, message: RaftMessage) {
        if let Some(term) = message.term() {
            if term > self.hard_state.term {
                let leader_id = match &message {
                    RaftMessage::AppendEntries { leader_id, .. }
                    | RaftMessage::InstallSnapshot { leader_id, .. } => *leader_id,
                    _ => 0,
                };
                self.step_down(term, leader_id);
            }
        }
        match message {
            RaftMessage::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_request_vote(term, candidate_id, last_log_index, last_log_term)
            }
            RaftMessage::RequestVoteResponse { term, from, vote_granted } => {
                self.handle_vote_response(term, from, vote_granted)
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendEntriesResponse { term, from, success, match_index } => {
                self.handle_append_response(term, from, success, match_index)
            }
            RaftMessage::InstallSnapshot { term, leader_id, last_index, last_term, ledger_height } => {
                self.handle_install_snapshot(term, leader_id, last_index, last_term, ledger_height)
            }
            RaftMessage::InstallSnapshotResponse { term, from, last_index } => {
                if term == self.hard_state.term && self.role == Role::Leader {
                    self.last_contact.insert(from, Instant::now());
                    self.match_index.insert(from, last_index);
                    self.next_index.insert(from, last_index + 1);
                }
            }
            RaftMessage::BlockRequest { from, start, end } => self.serve_blocks(from, start, end),
            RaftMessage::BlockResponse { from, blocks } => self.handle_block_response(from, blocks),
        }
    }

    fn handle_request_vote(
        &mut self,
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        let up_to_date = (last_log_term, last_log_index)
            >= (self.last_log_term(), self.last_log_index());
        let free_to_vote = self.hard_state.voted_for == 0
            || self.hard_state.voted_for == candidate_id;
        let grant = term == self.hard_state.term && free_to_vote && up_to_date;
        if grant {
            self.hard_state.voted_for = candidate_id;
            self.persist_hard_state();
            self.reset_election_deadline();
        }
        self.transport.send(
            candidate_id,
            RaftMessage::RequestVoteResponse {
                term: self.hard_state.term,
                from: self.id,
                vote_granted: grant,
            },
        );
    }

    fn handle_vote_response(&mut self, term: u64, from: u64, vote_granted: bool) {
        if self.role != Role::Candidate || term != self.hard_state.term || !vote_granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
    }

    fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) {
        if term < self.hard_state.term {
            self.transport.send(
                leader_id,
                RaftMessage::AppendEntriesResponse {
                    term: self.hard_state.term,
                    from: self.id,
                    success: false,
                    match_index: self.commit_index,
                },
            );
            return;
        }
        if self.role != Role::Follower || self.leader_id != leader_id {
            self.step_down(term, leader_id);
        }
        self.reset_election_deadline();

        // Consistency check on the entry preceding the shipped batch.
        // Anything at or below the snapshot point is committed history and
        // matches by construction.
        let consistent = if prev_log_index <= self.snapshot.last_index {
            true
        } else {
            self.term_at(prev_log_index) == Some(prev_log_term)
        };
        if !consistent {
            self.transport.send(
                leader_id,
                RaftMessage::AppendEntriesResponse {
                    term: self.hard_state.term,
                    from: self.id,
                    success: false,
                    match_index: self.commit_index,
                },
            );
            return;
        }

        let len_before = self.log.len();
        // The follower may hold a stale suffix past the shipped batch; only
        // entries the leader actually sent count as matched.
        let matched = prev_log_index + entries.len() as u64;
        let mut truncated = false;
        for entry in entries {
            if entry.index <= self.snapshot.last_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(existing_term) if existing_term == entry.term => continue,
                Some(_) => {
                    // Conflicting suffix: everything from here on belongs to a
                    // dead leader's log.
                    let keep = (entry.index - self.snapshot.last_index - 1) as usize;
                    self.log.truncate(keep);
                    truncated = true;
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
        }
        if truncated {
            if let Err(err) = self.storage.rewrite_log(&self.log) {
                panic!("failed to rewrite the raft log: {err}");
            }
        } else {
            for entry in self.log[len_before..].to_vec() {
                if let Err(err) = self.storage.append_entry(&entry) {
                    panic!("failed to append to the raft log: {err}");
                }
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(leader_commit.min(matched));
            self.apply_committed();
        }
        self.transport.send(
            leader_id,
            RaftMessage::AppendEntriesResponse {
                term: self.hard_state.term,
                from: self.id,
                success: true,
                match_index: matched.min(self.last_log_index()),
            },
        );
    }

    fn handle_append_response(&mut self, term: u64, from: u64, success: bool, match_index: u64) {
        if self.role != Role::Leader || term != self.hard_state.term {
            return;
        }
        self.last_contact.insert(from, Instant::now());
        if success {
            let known = self.match_index.entry(from).or_insert(0);
            *known = (*known).max(match_index);
            self.next_index.insert(from, *known + 1);
            self.advance_commit();
            if *self.next_index.get(&from).unwrap_or(&1) <= self.last_log_index() {
                self.send_append_entries(from);
            }
        } else {
            let next = self.next_index.entry(from).or_insert(1);
            *next = (*next - 1).clamp(1, match_index + 1);
            self.send_append_entries(from);
        }
    }

    fn advance_commit(&mut self) {
        let current_term = self.hard_state.term;
        let mut candidate = self.commit_index;
        for index in (self.commit_index + 1)..=self.last_log_index() {
            let replicas = 1 + self
                .match_index
                .values()
                .filter(|match_index| **match_index >= index)
                .count();
            if replicas >= self.majority() && self.term_at(index) == Some(current_term) {
                candidate = index;
            }
        }
        if candidate > self.commit_index {
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.entry_at(index) else {
                // Covered by a snapshot; the catch-up path delivers these.
                break;
            };
            let block = entry.block.clone();
            self.own_proposals.remove(&index);
            if self.committed_tx.send(block).is_err() {
                return;
            }
            self.last_applied = index;
        }
        self.maybe_take_snapshot();
    }

    /// Compacts the log once it outgrows the configured size. The snapshot
    /// records the ledger height; peers further behind than the compaction
    /// point are brought up through the block fetch path.
    fn maybe_take_snapshot(&mut self) {
        if self.storage.log_size() <= self.snapshot_interval_size
            || self.last_applied <= self.snapshot.last_index
        {
            return;
        }
        let Some(last_term) = self.term_at(self.last_applied) else {
            return;
        };
        let snapshot = Snapshot {
            last_index: self.last_applied,
            last_term,
            ledger_height: self.last_applied,
        };
        if let Err(err) = self.storage.persist_snapshot(&snapshot) {
            panic!("failed to persist raft snapshot: {err}");
        }
        let keep_from = (self.last_applied - self.snapshot.last_index) as usize;
        self.log.drain(..keep_from);
        self.snapshot = snapshot;
        if let Err(err) = self.storage.rewrite_log(&self.log) {
            panic!("failed to compact the raft log: {err}");
        }
        info!(target: "replication", id = self.id, last_index = self.snapshot.last_index,
              "took raft snapshot");
    }

    fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: u64,
        last_index: u64,
        last_term: u64,
        ledger_height: u64,
    ) {
        if term < self.hard_state.term {
            return;
        }
        self.step_down(term, leader_id);
        if last_index <= self.commit_index {
            // Already caught up past the leader's compaction point.
            self.transport.send(
                leader_id,
                RaftMessage::InstallSnapshotResponse {
                    term: self.hard_state.term,
                    from: self.id,
                    last_index: self.commit_index,
                },
            );
            return;
        }
        info!(target: "replication", id = self.id, ledger_height,
              "catching up from snapshot reference");
        self.catchup =
            Some(CatchupState { target_height: ledger_height, last_term, leader_id });
        self.request_catchup_blocks();
    }

    fn request_catchup_blocks(&mut self) {
        let Some(catchup) = &self.catchup else { return };
        self.transport.send(
            catchup.leader_id,
            RaftMessage::BlockRequest {
                from: self.id,
                start: self.last_applied + 1,
                end: catchup.target_height,
            },
        );
    }

    fn serve_blocks(&mut self, from: u64, start: u64, end: u64) {
        let end = end.min(self.ledger.height());
        if start == 0 || start > end {
            return;
        }
        let blocks: Vec<Block> = (start..=end)
            .take(MAX_BATCH)
            .map_while(|block_num| self.ledger.block(block_num))
            .collect();
        if !blocks.is_empty() {
            self.transport.send(from, RaftMessage::BlockResponse { from: self.id, blocks });
        }
    }

    fn handle_block_response(&mut self, _from: u64, blocks: Vec<Block>) {
        let Some(catchup) = &self.catchup else { return };
        let target_height = catchup.target_height;
        let last_term = catchup.last_term;
        let leader_id = catchup.leader_id;

        for block in blocks {
            if block.number() != self.last_applied + 1 {
                continue;
            }
            if self.committed_tx.send(block).is_err() {
                return;
            }
            self.last_applied += 1;
        }

        if self.last_applied >= target_height {
            let snapshot = Snapshot {
                last_index: target_height,
                last_term,
                ledger_height: target_height,
            };
            if let Err(err) = self.storage.persist_snapshot(&snapshot) {
                panic!("failed to persist raft snapshot: {err}");
            }
            self.log.retain(|entry| entry.index > target_height);
            self.snapshot = snapshot;
            if let Err(err) = self.storage.rewrite_log(&self.log) {
                panic!("failed to compact the raft log: {err}");
            }
            self.commit_index = self.commit_index.max(target_height);
            self.catchup = None;
            self.transport.send(
                leader_id,
                RaftMessage::InstallSnapshotResponse {
                    term: self.hard_state.term,
                    from: self.id,
                    last_index: target_height,
                },
            );
            info!(target: "replication", id = self.id, target_height, "catch-up complete");
        } else {
            self.request_catchup_blocks();
        }
    }
}
