use crate::committer::CommitWatch;
use crate::errors::TxError;
use crate::pending::PendingTxs;
use crossbeam_channel::Receiver;
use ledger_primitives::block::{Block, BlockHeader, BlockHeaderBase, BlockPayload};
use ledger_primitives::transaction::Transaction;
use ledger_replication::BlockReplicator;
use ledger_store::blockstore::BlockStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long the creator waits for its previous proposal to commit before it
/// assumes the proposal was dropped by a leadership change and re-reads the
/// ledger tail.
const PROPOSAL_COMMIT_PATIENCE: Duration = Duration::from_secs(10);

/// The block creator (proposer): assembles a block per batch with
/// monotonically increasing numbers and base-header linkage from the local
/// ledger, then submits it to the consensus adapter. Proposals serialize on
/// commit so the linkage always references block N-1.
pub(crate) fn run_creator(
    batch_queue: Receiver<Vec<Transaction>>,
    block_store: Arc<BlockStore>,
    replicator: Arc<BlockReplicator>,
    pending: Arc<PendingTxs>,
    commit_watch: Arc<CommitWatch>,
) {
    let mut last_proposed = block_store.height();
    while let Ok(batch) = batch_queue.recv() {
        if !commit_watch.wait_at_least(last_proposed, PROPOSAL_COMMIT_PATIENCE) {
            warn!(target: "processor", last_proposed,
                  "previous proposal did not commit, re-reading ledger tail");
            last_proposed = commit_watch.height();
        }

        let block = match build_block(&block_store, batch) {
            Ok(block) => block,
            Err((tx_ids, err)) => {
                pending.release_with_error(&tx_ids, &err);
                continue;
            }
        };
        let number = block.number();
        let tx_ids = block.tx_ids();
        match replicator.submit(block) {
            Ok(()) => {
                debug!(target: "processor", number, "proposed block");
                last_proposed = number;
            }
            Err(not_leader) => {
                pending.release_with_error(&tx_ids, &TxError::NotLeader(not_leader));
            }
        }
    }
}

fn build_block(
    block_store: &BlockStore,
    batch: Vec<Transaction>,
) -> Result<Block, (Vec<String>, TxError)> {
    let height = block_store.height();
    let base_header = if height == 0 {
        BlockHeaderBase { number: 1, ..Default::default() }
    } else {
        let last_hash = block_store.get_hash(height);
        let last_base_hash = block_store.get_base_header_hash(height);
        match (last_hash, last_base_hash) {
            (Ok(last_committed_block_hash), Ok(previous_base_header_hash)) => BlockHeaderBase {
                number: height + 1,
                previous_base_header_hash,
                last_committed_block_hash,
                last_committed_block_num: height,
            },
            (Err(err), _) | (_, Err(err)) => {
                let tx_ids = batch.iter().map(|tx| tx.tx_id().to_string()).collect();
                return Err((tx_ids, TxError::Storage(err.to_string())));
            }
        }
    };

    let is_admin_batch = batch.first().is_some_and(Transaction::is_admin);
    let payload = if is_admin_batch {
        debug_assert_eq!(batch.len(), 1, "admin transactions ship alone");
        match batch.into_iter().next() {
            Some(Transaction::Config(envelope)) => BlockPayload::ConfigTx(envelope),
            Some(Transaction::DbAdmin(envelope)) => BlockPayload::DbAdminTx(envelope),
            Some(Transaction::UserAdmin(envelope)) => BlockPayload::UserAdminTx(envelope),
            _ => unreachable!("first element checked above"),
        }
    } else {
        BlockPayload::DataTxs(
            batch
                .into_iter()
                .map(|tx| match tx {
                    Transaction::Data(envelope) => envelope,
                    _ => unreachable!("admin transactions ship alone"),
                })
                .collect(),
        )
    };

    // Validation info, merkle root and skip links are derived by the
    // committer on every node so the proposal carries only the payload and
    // linkage.
    Ok(Block {
        header: BlockHeader { base_header, ..Default::default() },
        payload,
    })
}
