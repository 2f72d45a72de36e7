use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ledger_primitives::transaction::Transaction;
use std::time::{Duration, Instant};
use tracing::debug;

/// Drains the transaction queue into ordered batches. A batch closes when it
/// reaches `max_tx_count_per_batch` or when `batch_timeout` elapsed since its
/// first transaction. Administrative transactions always ship as singleton
/// batches, flushing any open data batch first.
pub(crate) fn run_batcher(
    tx_queue: Receiver<Transaction>,
    batch_queue: Sender<Vec<Transaction>>,
    max_tx_count_per_batch: usize,
    batch_timeout: Duration,
) {
    loop {
        let first = match tx_queue.recv() {
            Ok(tx) => tx,
            Err(_) => return,
        };
        if first.is_admin() {
            if batch_queue.send(vec![first]).is_err() {
                return;
            }
            continue;
        }

        let mut batch = vec![first];
        let mut trailing_admin = None;
        let deadline = Instant::now() + batch_timeout;
        while batch.len() < max_tx_count_per_batch {
            match tx_queue.recv_deadline(deadline) {
                Ok(tx) if tx.is_admin() => {
                    trailing_admin = Some(tx);
                    break;
                }
                Ok(tx) => batch.push(tx),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = batch_queue.send(batch);
                    return;
                }
            }
        }

        debug!(target: "processor", txs = batch.len(), "closed transaction batch");
        if batch_queue.send(batch).is_err() {
            return;
        }
        if let Some(admin) = trailing_admin {
            if batch_queue.send(vec![admin]).is_err() {
                return;
            }
        }
    }
}
