pub use crate::message::{LogEntry, RaftMessage};
pub use crate::replicator::{
    BlockReplicator, LedgerAccess, NotLeaderError, PeerConfig, ReplicationConfig,
    ReplicationError,
};
pub use crate::transport::{InProcTransport, Transport};

mod message;
mod raft;
mod replicator;
mod storage;
mod transport;
