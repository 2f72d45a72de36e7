use crate::batcher::run_batcher;
use crate::committer::{CommitWatch, Committer};
use crate::creator::run_creator;
use crate::errors::{SubmitOutcome, TxError};
use crate::pending::PendingTxs;
use crate::validator::{SignatureVerifier, Validator};
use crossbeam_channel::{RecvTimeoutError, Sender};
use ledger_primitives::transaction::Transaction;
use ledger_replication::{BlockReplicator, NotLeaderError};
use ledger_store::blockstore::BlockStore;
use ledger_store::provenance::ProvenanceStore;
use ledger_store::worldstate::StateStore;
use ledger_store::IdentityQuerier;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub tx_queue_depth: usize,
    pub batch_queue_depth: usize,
    pub max_tx_count_per_batch: usize,
    pub batch_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            tx_queue_depth: 1000,
            batch_queue_depth: 100,
            max_tx_count_per_batch: 100,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

/// The transaction pipeline of a node: submission with duplicate rejection
/// and completion promises, batching, block proposal on the leader, and the
/// commit loop applying consensus-ordered blocks to the three stores.
pub struct TransactionProcessor {
    pending: Arc<PendingTxs>,
    tx_sender: Mutex<Option<Sender<Transaction>>>,
    replicator: Arc<BlockReplicator>,
    halted: Arc<AtomicBool>,
    closed: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionProcessor {
    pub fn start(
        config: ProcessorConfig,
        state: Arc<StateStore>,
        block_store: Arc<BlockStore>,
        provenance: Arc<ProvenanceStore>,
        replicator: Arc<BlockReplicator>,
    ) -> Self {
        let pending = Arc::new(PendingTxs::new());
        let sig_verifier =
            Arc::new(SignatureVerifier::new(IdentityQuerier::new(Arc::clone(&state))));
        let validator = Arc::new(Validator::new(
            Arc::clone(&state),
            Arc::clone(&provenance),
            Arc::clone(&sig_verifier),
        ));
        let commit_watch = Arc::new(CommitWatch::new(block_store.height()));
        let halted = Arc::new(AtomicBool::new(false));

        let (tx_sender, tx_receiver) = crossbeam_channel::bounded(config.tx_queue_depth);
        let (batch_sender, batch_receiver) =
            crossbeam_channel::bounded(config.batch_queue_depth);

        let mut handles = vec![];

        let max_count = config.max_tx_count_per_batch;
        let timeout = config.batch_timeout;
        handles.push(
            std::thread::Builder::new()
                .name("tx-batcher".to_string())
                .spawn(move || run_batcher(tx_receiver, batch_sender, max_count, timeout))
                .expect("spawning the batcher thread should not fail"),
        );

        {
            let block_store = Arc::clone(&block_store);
            let replicator = Arc::clone(&replicator);
            let pending = Arc::clone(&pending);
            let commit_watch = Arc::clone(&commit_watch);
            handles.push(
                std::thread::Builder::new()
                    .name("block-creator".to_string())
                    .spawn(move || {
                        run_creator(batch_receiver, block_store, replicator, pending, commit_watch)
                    })
                    .expect("spawning the creator thread should not fail"),
            );
        }

        {
            let committer = Committer {
                state,
                block_store,
                provenance,
                validator,
                sig_verifier,
                pending: Arc::clone(&pending),
                commit_watch,
                halted: Arc::clone(&halted),
            };
            let committed_blocks = replicator.committed_blocks();
            handles.push(
                std::thread::Builder::new()
                    .name("block-committer".to_string())
                    .spawn(move || committer.run(committed_blocks))
                    .expect("spawning the committer thread should not fail"),
            );
        }

        {
            // Blocks dropped by the consensus adapter (leadership changes)
            // release their transactions' promises with a not-leader error.
            let dropped_blocks = replicator.dropped_blocks();
            let pending = Arc::clone(&pending);
            let replicator = Arc::clone(&replicator);
            handles.push(
                std::thread::Builder::new()
                    .name("dropped-drainer".to_string())
                    .spawn(move || {
                        while let Ok(block) = dropped_blocks.recv() {
                            let err = replicator
                                .is_leader()
                                .err()
                                .unwrap_or(NotLeaderError {
                                    leader_id: 0,
                                    leader_host_port: String::new(),
                                });
                            pending
                                .release_with_error(&block.tx_ids(), &TxError::NotLeader(err));
                        }
                    })
                    .expect("spawning the drainer thread should not fail"),
            );
        }

        info!(target: "processor", "transaction processor started");
        TransactionProcessor {
            pending,
            tx_sender: Mutex::new(Some(tx_sender)),
            replicator,
            halted,
            closed: AtomicBool::new(false),
            handles: Mutex::new(handles),
        }
    }

    /// Submits a signed transaction. Rejects on a non-leader node and for
    /// duplicate tx ids already in flight. With a non-zero timeout the call
    /// waits for the completion promise and returns the receipt or the
    /// transaction's failure; with no timeout (or zero) it returns as soon as
    /// the transaction is queued.
    pub fn submit_transaction(
        &self,
        tx: Transaction,
        timeout: Option<Duration>,
    ) -> Result<SubmitOutcome, TxError> {
        if self.closed.load(Ordering::SeqCst) || self.halted.load(Ordering::SeqCst) {
            return Err(TxError::Shutdown);
        }
        self.replicator.is_leader()?;

        let tx_id = tx.tx_id().to_string();
        let receiver = self.pending.add(&tx_id)?;

        let sender = match &*self.tx_sender.lock() {
            Some(sender) => sender.clone(),
            None => {
                self.pending.load_and_delete(&tx_id);
                return Err(TxError::Shutdown);
            }
        };
        // Bounded queue: a full pipeline applies backpressure here.
        if sender.send(tx).is_err() {
            self.pending.load_and_delete(&tx_id);
            return Err(TxError::Shutdown);
        }

        match timeout {
            None => Ok(SubmitOutcome::Submitted),
            Some(timeout) if timeout.is_zero() => Ok(SubmitOutcome::Submitted),
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(Ok(receipt)) => Ok(SubmitOutcome::Receipt(receipt)),
                Ok(Err(err)) => Err(err),
                // The promise detaches from the caller, not from the commit
                // path: the transaction may still commit.
                Err(RecvTimeoutError::Timeout) => Ok(SubmitOutcome::TimedOut),
                Err(RecvTimeoutError::Disconnected) => Err(TxError::Shutdown),
            },
        }
    }

    pub fn is_leader(&self) -> Result<(), NotLeaderError> {
        self.replicator.is_leader()
    }

    pub fn pending_txs(&self) -> &Arc<PendingTxs> {
        &self.pending
    }

    /// Stops the pipeline: creator and batcher drain first, then the
    /// consensus adapter and committer; everything still pending resolves
    /// with a shutdown error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the submission side lets the batcher, then the creator,
        // run dry and exit.
        self.tx_sender.lock().take();
        self.replicator.close();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        self.pending.drain(&TxError::Shutdown);
        info!(target: "processor", "transaction processor closed");
    }
}

impl Drop for TransactionProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

/// [`ledger_replication::LedgerAccess`] over the block store, letting the
/// consensus adapter serve catch-up requests and resume from the committed
/// ledger tail.
pub struct BlockStoreLedger(pub Arc<BlockStore>);

impl ledger_replication::LedgerAccess for BlockStoreLedger {
    fn height(&self) -> u64 {
        self.0.height()
    }

    fn block(&self, block_num: u64) -> Option<ledger_primitives::block::Block> {
        self.0.get(block_num).ok()
    }
}
