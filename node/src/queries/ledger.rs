use super::{
    sign_response, GetBlockResponse, GetLedgerPathResponse, GetTxProofResponse,
    GetTxReceiptResponse, LedgerReader, QueryError, ResponseEnvelope,
};
use ledger_crypto::InMemorySigner;
use ledger_primitives::merkle::tx_proof;
use ledger_primitives::transaction::TxReceipt;
use ledger_primitives::types::BlockNum;
use ledger_store::blockstore::{BlockStore, BlockStoreError};
use ledger_store::provenance::ProvenanceStore;
use ledger_store::IdentityQuerier;
use std::sync::Arc;

/// Serves the chain-of-blocks queries: headers, skip-list paths, Merkle
/// proofs and receipts. Any registered user may read the ledger.
pub struct LedgerQueryProcessor {
    block_store: Arc<BlockStore>,
    provenance: Arc<ProvenanceStore>,
    identity: IdentityQuerier,
    signer: Arc<InMemorySigner>,
}

impl LedgerQueryProcessor {
    pub fn new(
        block_store: Arc<BlockStore>,
        provenance: Arc<ProvenanceStore>,
        identity: IdentityQuerier,
        signer: Arc<InMemorySigner>,
    ) -> Self {
        LedgerQueryProcessor { block_store, provenance, identity, signer }
    }

    fn require_ledger_access(&self, user_id: &str) -> Result<(), QueryError> {
        if !self.identity.user_exists(user_id).map_err(QueryError::from)? {
            return Err(QueryError::Permission {
                user_id: user_id.to_string(),
                action: "access the ledger".to_string(),
            });
        }
        Ok(())
    }
}

impl LedgerReader for LedgerQueryProcessor {
    fn get_block_header(
        &self,
        user_id: &str,
        block_num: BlockNum,
    ) -> Result<ResponseEnvelope<GetBlockResponse>, QueryError> {
        self.require_ledger_access(user_id)?;
        let block_header = match self.block_store.get_header(block_num) {
            Ok(header) => Some(header),
            Err(BlockStoreError::NotFound { .. }) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(sign_response(&self.signer, GetBlockResponse { block_header }))
    }

    fn get_ledger_path(
        &self,
        user_id: &str,
        start: BlockNum,
        end: BlockNum,
    ) -> Result<ResponseEnvelope<GetLedgerPathResponse>, QueryError> {
        self.require_ledger_access(user_id)?;
        let blocks = self.block_store.get_path(start, end)?;
        Ok(sign_response(
            &self.signer,
            GetLedgerPathResponse {
                block_headers: blocks.into_iter().map(|block| block.header).collect(),
            },
        ))
    }

    fn get_tx_proof(
        &self,
        user_id: &str,
        block_num: BlockNum,
        tx_index: u64,
    ) -> Result<ResponseEnvelope<GetTxProofResponse>, QueryError> {
        self.require_ledger_access(user_id)?;
        let block = self.block_store.get(block_num)?;
        let proof = tx_proof(&block, tx_index)?;
        Ok(sign_response(&self.signer, GetTxProofResponse { block_num, tx_index, proof }))
    }

    fn get_tx_receipt(
        &self,
        user_id: &str,
        tx_id: &str,
    ) -> Result<ResponseEnvelope<GetTxReceiptResponse>, QueryError> {
        self.require_ledger_access(user_id)?;
        let Some((block_num, tx_index)) =
            self.provenance.get_tx_locator(tx_id).map_err(QueryError::from)?
        else {
            return Err(QueryError::NotFound(format!(
                "transaction id [{tx_id}] is not present in the ledger"
            )));
        };
        let header = self.block_store.get_header(block_num)?;
        Ok(sign_response(
            &self.signer,
            GetTxReceiptResponse { receipt: TxReceipt { header, tx_index } },
        ))
    }
}
