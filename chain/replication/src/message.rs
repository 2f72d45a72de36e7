use borsh::{BorshDeserialize, BorshSerialize};
use ledger_primitives::block::Block;

/// One replicated log entry: a proposed block at a raft position. Committed
/// entries map one-to-one onto ledger blocks, so `index` equals the block
/// number once the entry commits.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub block: Block,
}

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        from: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        from: u64,
        success: bool,
        /// Highest log index known replicated on the follower when
        /// `success`; the follower's last log index otherwise, letting the
        /// leader back off without probing one entry at a time.
        match_index: u64,
    },
    /// Sent when the follower is behind the leader's compacted log. The
    /// snapshot carries a ledger reference rather than state: the follower
    /// fetches the missing blocks from the leader and replays them.
    InstallSnapshot {
        term: u64,
        leader_id: u64,
        last_index: u64,
        last_term: u64,
        ledger_height: u64,
    },
    InstallSnapshotResponse {
        term: u64,
        from: u64,
        last_index: u64,
    },
    /// Catch-up block fetch, served from the peer's block store.
    BlockRequest {
        from: u64,
        start: u64,
        end: u64,
    },
    BlockResponse {
        from: u64,
        blocks: Vec<Block>,
    },
}

impl RaftMessage {
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => Some(*term),
            RaftMessage::BlockRequest { .. } | RaftMessage::BlockResponse { .. } => None,
        }
    }
}
