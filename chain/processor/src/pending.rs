use crate::errors::TxError;
use crossbeam_channel::{Receiver, Sender};
use ledger_primitives::block::BlockHeader;
use ledger_primitives::transaction::TxReceipt;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::debug;

const SHARDS: usize = 8;

/// Single-shot completion handle of a submitted transaction. Consumed by
/// `done` or `error`, so it can never fire twice; if the submitter stopped
/// waiting, the send lands in a dropped channel and is discarded.
pub struct CompletionPromise {
    sender: Sender<Result<TxReceipt, TxError>>,
}

impl CompletionPromise {
    pub fn new() -> (Self, Receiver<Result<TxReceipt, TxError>>) {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        (CompletionPromise { sender }, receiver)
    }

    pub fn done(self, receipt: TxReceipt) {
        let _ = self.sender.send(Ok(receipt));
    }

    pub fn error(self, err: TxError) {
        let _ = self.sender.send(Err(err));
    }
}

/// Map of in-flight transactions keyed by tx id, sharded to keep submission
/// and commit paths from contending on one lock.
pub struct PendingTxs {
    shards: Vec<RwLock<HashMap<String, CompletionPromise>>>,
}

impl Default for PendingTxs {
    fn default() -> Self {
        PendingTxs { shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect() }
    }
}

impl PendingTxs {
    pub fn new() -> Self {
        PendingTxs::default()
    }

    fn shard(&self, tx_id: &str) -> &RwLock<HashMap<String, CompletionPromise>> {
        let mut hasher = DefaultHasher::new();
        tx_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Installs a promise for `tx_id` unless one already exists
    /// (load-or-store semantics). Returns the receiver the submitter may
    /// wait on.
    pub fn add(&self, tx_id: &str) -> Result<Receiver<Result<TxReceipt, TxError>>, TxError> {
        let mut shard = self.shard(tx_id).write();
        if shard.contains_key(tx_id) {
            return Err(TxError::AlreadyExists { tx_id: tx_id.to_string() });
        }
        let (promise, receiver) = CompletionPromise::new();
        shard.insert(tx_id.to_string(), promise);
        Ok(receiver)
    }

    pub fn has(&self, tx_id: &str) -> bool {
        self.shard(tx_id).read().contains_key(tx_id)
    }

    pub fn load_and_delete(&self, tx_id: &str) -> Option<CompletionPromise> {
        self.shard(tx_id).write().remove(tx_id)
    }

    /// Resolves the promises of a committed block. `tx_ids` must be in block
    /// order; `errors[i]` carries the invalidity of transaction i, if any.
    pub fn done_with_receipt(
        &self,
        tx_ids: &[String],
        block_header: &BlockHeader,
        errors: &[Option<TxError>],
    ) {
        debug!(target: "processor", block_num = block_header.number(), txs = tx_ids.len(),
               "resolving promises with receipts");
        for (tx_index, tx_id) in tx_ids.iter().enumerate() {
            let Some(promise) = self.load_and_delete(tx_id) else { continue };
            match errors.get(tx_index).and_then(Clone::clone) {
                Some(err) => promise.error(err),
                None => promise.done(TxReceipt {
                    header: block_header.clone(),
                    tx_index: tx_index as u64,
                }),
            }
        }
    }

    /// Fails the promises of transactions whose block will never arrive,
    /// typically after a leadership change.
    pub fn release_with_error(&self, tx_ids: &[String], err: &TxError) {
        debug!(target: "processor", txs = tx_ids.len(), %err, "releasing promises with error");
        for tx_id in tx_ids {
            if let Some(promise) = self.load_and_delete(tx_id) {
                promise.error(err.clone());
            }
        }
    }

    /// Fails everything still pending. Shutdown path.
    pub fn drain(&self, err: &TxError) {
        for shard in &self.shards {
            for (_, promise) in shard.write().drain() {
                promise.error(err.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn add_is_load_or_store() {
        let pending = PendingTxs::new();
        let receiver = pending.add("tx1").unwrap();
        assert_matches!(pending.add("tx1"), Err(TxError::AlreadyExists { .. }));
        assert!(pending.has("tx1"));
        drop(receiver);
        // A dropped receiver does not free the slot; only resolution does.
        assert!(pending.has("tx1"));
    }

    #[test]
    fn done_with_receipt_resolves_in_block_order() {
        let pending = PendingTxs::new();
        let rx1 = pending.add("tx1").unwrap();
        let rx2 = pending.add("tx2").unwrap();

        let header = BlockHeader::default();
        pending.done_with_receipt(
            &["tx1".to_string(), "tx2".to_string()],
            &header,
            &[
                None,
                Some(TxError::Invalid {
                    flag: ledger_primitives::validation::Flag::InvalidSignature,
                    reason: "missing signer".to_string(),
                }),
            ],
        );

        let receipt = rx1.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(receipt.tx_index, 0);
        assert_matches!(
            rx2.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(TxError::Invalid { .. })
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn detached_caller_does_not_block_resolution() {
        let pending = PendingTxs::new();
        let receiver = pending.add("tx1").unwrap();
        drop(receiver);
        pending.done_with_receipt(&["tx1".to_string()], &BlockHeader::default(), &[None]);
        assert!(pending.is_empty());
    }

    #[test]
    fn drain_fails_everything() {
        let pending = PendingTxs::new();
        let rx1 = pending.add("tx1").unwrap();
        let rx2 = pending.add("tx2").unwrap();
        pending.drain(&TxError::Shutdown);
        assert_matches!(rx1.recv().unwrap(), Err(TxError::Shutdown));
        assert_matches!(rx2.recv().unwrap(), Err(TxError::Shutdown));
        assert!(pending.is_empty());
    }

    #[test]
    fn release_with_error_skips_unknown_ids() {
        let pending = PendingTxs::new();
        let rx = pending.add("tx1").unwrap();
        pending.release_with_error(
            &["tx1".to_string(), "unknown".to_string()],
            &TxError::Shutdown,
        );
        assert_matches!(rx.recv().unwrap(), Err(TxError::Shutdown));
    }
}
