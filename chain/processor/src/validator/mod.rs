use ledger_primitives::block::{Block, BlockPayload};
use ledger_primitives::validation::{Flag, ValidationInfo};
use ledger_store::provenance::{ProvenanceError, ProvenanceStore};
use ledger_store::worldstate::{StateStore, WorldStateError};
use ledger_store::IdentityQuerier;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

mod admin_tx;
mod data_tx;
mod sig;

pub use sig::SignatureVerifier;

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("state access failed during validation: {0}")]
    State(#[from] WorldStateError),
    #[error("provenance access failed during validation: {0}")]
    Provenance(#[from] ProvenanceError),
}

/// Validates each transaction of a block against the committed state to
/// enforce the serialisable-snapshot isolation level, plus signature,
/// permission and schema rules. Validation is deterministic: every node
/// derives identical flags for the same block over the same state.
pub struct Validator {
    pub(crate) state: Arc<StateStore>,
    pub(crate) provenance: Arc<ProvenanceStore>,
    pub(crate) identity: IdentityQuerier,
    pub(crate) sig_verifier: Arc<SignatureVerifier>,
}

impl Validator {
    pub fn new(
        state: Arc<StateStore>,
        provenance: Arc<ProvenanceStore>,
        sig_verifier: Arc<SignatureVerifier>,
    ) -> Self {
        let identity = IdentityQuerier::new(Arc::clone(&state));
        Validator { state, provenance, identity, sig_verifier }
    }

    /// Ledger-lifetime tx id uniqueness: a tx id that already committed, in
    /// any earlier block, can never commit again.
    pub(crate) fn check_committed_tx_id(
        &self,
        tx_id: &str,
    ) -> Result<Option<ValidationInfo>, ValidatorError> {
        if self.provenance.get_tx_locator(tx_id)?.is_some() {
            return Ok(Some(ValidationInfo::invalid(
                Flag::InvalidIncorrectEntries,
                format!("transaction id [{tx_id}] was already committed"),
            )));
        }
        Ok(None)
    }

    pub fn validate_block(&self, block: &Block) -> Result<Vec<ValidationInfo>, ValidatorError> {
        if block.number() == 1 {
            // The genesis block is produced by the node itself; regular
            // validation does not apply but its entries must be well formed.
            return Ok(vec![self.validate_genesis(block)]);
        }
        match &block.payload {
            BlockPayload::DataTxs(envelopes) => self.validate_data_block(envelopes),
            BlockPayload::ConfigTx(envelope) => Ok(vec![self.validate_config_tx(envelope)?]),
            BlockPayload::DbAdminTx(envelope) => Ok(vec![self.validate_db_admin_tx(envelope)?]),
            BlockPayload::UserAdminTx(envelope) => {
                Ok(vec![self.validate_user_admin_tx(envelope)?])
            }
        }
    }

    fn validate_genesis(&self, block: &Block) -> ValidationInfo {
        let BlockPayload::ConfigTx(envelope) = &block.payload else {
            return ValidationInfo::invalid(
                Flag::InvalidIncorrectEntries,
                "genesis block must carry a config transaction",
            );
        };
        match envelope.payload.new_config.validate() {
            Ok(()) => ValidationInfo::valid(),
            Err(reason) => ValidationInfo::invalid(Flag::InvalidIncorrectEntries, reason),
        }
    }

    fn validate_data_block(
        &self,
        envelopes: &[ledger_primitives::transaction::DataTxEnvelope],
    ) -> Result<Vec<ValidationInfo>, ValidatorError> {
        // Phase one: signature verification fans out, one task per
        // transaction, each writing its own result slot.
        let sig_results: Vec<Result<(ValidationInfo, Vec<String>), ValidatorError>> =
            envelopes.par_iter().map(|envelope| self.validate_data_signatures(envelope)).collect();

        let mut info = Vec::with_capacity(envelopes.len());
        let mut signers_per_tx = Vec::with_capacity(envelopes.len());
        for result in sig_results {
            let (tx_info, signers) = result?;
            info.push(tx_info);
            signers_per_tx.push(signers);
        }

        // Phase two: sequential commit-phase validation in block order.
        let mut pending_ops = PendingOps::default();
        for (tx_num, envelope) in envelopes.iter().enumerate() {
            if !info[tx_num].is_valid() {
                continue;
            }
            let tx_info =
                self.validate_data_commit(envelope, &signers_per_tx[tx_num], &pending_ops)?;
            if !tx_info.is_valid() {
                debug!(target: "validator", tx_id = %envelope.payload.tx_id,
                       flag = %tx_info.flag, reason = %tx_info.reason, "data transaction invalid");
                info[tx_num] = tx_info;
                continue;
            }
            for op in &envelope.payload.db_operations {
                for write in &op.writes {
                    pending_ops.add_write(&op.db_name, &write.key);
                }
                for delete in &op.deletes {
                    pending_ops.add_delete(&op.db_name, &delete.key);
                }
            }
            info[tx_num] = tx_info;
        }
        Ok(info)
    }
}

/// Keys written or deleted by earlier valid transactions of the block under
/// validation. Reading or touching such a key is a within-block conflict.
#[derive(Default)]
pub(crate) struct PendingOps {
    writes: HashSet<(String, String)>,
    deletes: HashSet<(String, String)>,
}

impl PendingOps {
    fn add_write(&mut self, db_name: &str, key: &str) {
        self.writes.insert((db_name.to_string(), key.to_string()));
    }

    fn add_delete(&mut self, db_name: &str, key: &str) {
        self.deletes.insert((db_name.to_string(), key.to_string()));
    }

    pub(crate) fn exists(&self, db_name: &str, key: &str) -> bool {
        let composite = (db_name.to_string(), key.to_string());
        self.writes.contains(&composite) || self.deletes.contains(&composite)
    }
}
