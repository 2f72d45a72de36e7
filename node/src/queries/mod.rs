use borsh::BorshSerialize;
use ledger_crypto::InMemorySigner;
use ledger_primitives::block::BlockHeader;
use ledger_primitives::cluster::ClusterConfig;
use ledger_primitives::merkle::{MerkleError, TxProof};
use ledger_primitives::transaction::{Transaction, TxReceipt};
use ledger_primitives::types::{BlockNum, Metadata, User, Version};
use ledger_processor::{SubmitOutcome, TxError};
use ledger_store::blockstore::BlockStoreError;
use ledger_store::provenance::ProvenanceError;
use ledger_store::worldstate::WorldStateError;
use std::collections::BTreeMap;
use std::time::Duration;

mod ledger;
mod provenance;
mod worldstate;

pub use ledger::LedgerQueryProcessor;
pub use provenance::ProvenanceQueryProcessor;
pub use worldstate::WorldstateQueryProcessor;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("user [{user_id}] has no permission to {action}")]
    Permission { user_id: String, action: String },
    #[error("{0}")]
    NotFound(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("storage failure while serving query: {0}")]
    Storage(String),
}

impl From<WorldStateError> for QueryError {
    fn from(err: WorldStateError) -> Self {
        match err {
            WorldStateError::DbNotFound { db_name } => {
                QueryError::NotFound(format!("database {db_name} does not exist"))
            }
            other => QueryError::Storage(other.to_string()),
        }
    }
}

impl From<BlockStoreError> for QueryError {
    fn from(err: BlockStoreError) -> Self {
        match err {
            BlockStoreError::NotFound { .. } => QueryError::NotFound(err.to_string()),
            BlockStoreError::InvertedRange { .. } => QueryError::InvalidQuery(err.to_string()),
            other => QueryError::Storage(other.to_string()),
        }
    }
}

impl From<ProvenanceError> for QueryError {
    fn from(err: ProvenanceError) -> Self {
        QueryError::Storage(err.to_string())
    }
}

impl From<MerkleError> for QueryError {
    fn from(err: MerkleError) -> Self {
        match err {
            MerkleError::IndexOutOfBounds { .. } => QueryError::InvalidQuery(err.to_string()),
            other => QueryError::Storage(other.to_string()),
        }
    }
}

/// Every query response is wrapped in an envelope signed with the node's
/// operator key over the canonical borsh encoding of the payload, so clients
/// can hold the node accountable for what it served.
#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ResponseEnvelope<T> {
    pub payload: T,
    pub signature: Vec<u8>,
}

pub(crate) fn sign_response<T: BorshSerialize>(
    signer: &InMemorySigner,
    payload: T,
) -> ResponseEnvelope<T> {
    let bytes = borsh::to_vec(&payload).expect("borsh serialization should not fail");
    let signature = signer.sign(&bytes).to_vec();
    ResponseEnvelope { payload, signature }
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetDataResponse {
    pub db_name: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub metadata: Option<Metadata>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetDbStatusResponse {
    pub db_name: String,
    pub exists: bool,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetUserResponse {
    pub user: Option<User>,
    pub metadata: Option<Metadata>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetConfigResponse {
    pub config: Option<ClusterConfig>,
    pub metadata: Option<Metadata>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetBlockResponse {
    pub block_header: Option<BlockHeader>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetLedgerPathResponse {
    pub block_headers: Vec<BlockHeader>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetTxProofResponse {
    pub block_num: BlockNum,
    pub tx_index: u64,
    pub proof: TxProof,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetTxReceiptResponse {
    pub receipt: TxReceipt,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct HistoricalValue {
    pub value: Vec<u8>,
    pub version: Version,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetHistoricalDataResponse {
    pub values: Vec<HistoricalValue>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UserAccessedValue {
    pub db_name: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub version: Version,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetUserAccessResponse {
    pub values: Vec<UserAccessedValue>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetAccessorsResponse {
    pub users: BTreeMap<String, u64>,
}

#[derive(BorshSerialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GetTxIdsSubmittedByResponse {
    pub tx_ids: Vec<String>,
}

/// Read access to the current state, gated by user permissions.
pub trait StateReader {
    fn get_data(
        &self,
        db_name: &str,
        querier_user_id: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetDataResponse>, QueryError>;

    fn get_db_status(
        &self,
        db_name: &str,
    ) -> Result<ResponseEnvelope<GetDbStatusResponse>, QueryError>;

    fn get_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserResponse>, QueryError>;

    fn get_config(
        &self,
        querier_user_id: &str,
    ) -> Result<ResponseEnvelope<GetConfigResponse>, QueryError>;
}

/// Read access to the block ledger with cryptographic proofs.
pub trait LedgerReader {
    fn get_block_header(
        &self,
        user_id: &str,
        block_num: BlockNum,
    ) -> Result<ResponseEnvelope<GetBlockResponse>, QueryError>;

    fn get_ledger_path(
        &self,
        user_id: &str,
        start: BlockNum,
        end: BlockNum,
    ) -> Result<ResponseEnvelope<GetLedgerPathResponse>, QueryError>;

    fn get_tx_proof(
        &self,
        user_id: &str,
        block_num: BlockNum,
        tx_index: u64,
    ) -> Result<ResponseEnvelope<GetTxProofResponse>, QueryError>;

    fn get_tx_receipt(
        &self,
        user_id: &str,
        tx_id: &str,
    ) -> Result<ResponseEnvelope<GetTxReceiptResponse>, QueryError>;
}

/// Read access to the historical provenance graph.
pub trait ProvenanceReader {
    fn get_historical_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError>;

    fn get_value_at(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError>;

    fn get_previous_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError>;

    fn get_next_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError>;

    fn get_values_read_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError>;

    fn get_values_written_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError>;

    fn get_values_deleted_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError>;

    fn get_readers(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetAccessorsResponse>, QueryError>;

    fn get_writers(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetAccessorsResponse>, QueryError>;

    fn get_tx_ids_submitted_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetTxIdsSubmittedByResponse>, QueryError>;
}

/// Transaction submission.
pub trait Submitter {
    fn submit_transaction(
        &self,
        tx: Transaction,
        timeout: Option<Duration>,
    ) -> Result<SubmitOutcome, TxError>;
}
