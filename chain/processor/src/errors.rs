use ledger_primitives::transaction::TxReceipt;
use ledger_primitives::validation::Flag;
use ledger_replication::NotLeaderError;

/// Terminal outcome of a submitted transaction, delivered through its
/// completion promise or returned synchronously.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error(transparent)]
    NotLeader(#[from] NotLeaderError),
    #[error("transaction with id [{tx_id}] is already being processed")]
    AlreadyExists { tx_id: String },
    #[error("transaction was flagged [{flag}]: {reason}")]
    Invalid { flag: Flag, reason: String },
    #[error("the transaction processor is shut down")]
    Shutdown,
    #[error("storage failure while committing: {0}")]
    Storage(String),
}

/// Result of `submit_transaction` when it does not fail outright.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Asynchronous submission: the transaction is queued, the caller did not
    /// wait.
    Submitted,
    /// Synchronous submission that committed within the timeout.
    Receipt(TxReceipt),
    /// The wait timed out. The transaction may still commit; the promise is
    /// detached from the caller, not from the commit path.
    TimedOut,
}
