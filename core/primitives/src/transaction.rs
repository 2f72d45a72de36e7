use crate::block::BlockHeader;
use crate::cluster::ClusterConfig;
use crate::types::{AccessControl, User, Version};
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

/// A read recorded in a transaction's read set. `version` is the committed
/// version the client observed, or unset if the key did not exist.
#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DataRead {
    pub key: String,
    pub version: Version,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DataWrite {
    pub key: String,
    pub value: Vec<u8>,
    pub acl: Option<AccessControl>,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DataDelete {
    pub key: String,
}

/// Reads, writes and deletes of a data transaction against one database.
#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DbOperation {
    pub db_name: String,
    pub reads: Vec<DataRead>,
    pub writes: Vec<DataWrite>,
    pub deletes: Vec<DataDelete>,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DataTx {
    /// Users whose signatures are all required for the transaction to be
    /// valid. The first entry is the submitting user.
    pub must_sign_user_ids: Vec<String>,
    pub tx_id: String,
    pub db_operations: Vec<DbOperation>,
}

/// Signed data transaction. `signatures` maps a user id to that user's
/// signature over the canonical borsh encoding of `payload`.
#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DataTxEnvelope {
    pub payload: DataTx,
    pub signatures: BTreeMap<String, Vec<u8>>,
}

impl DataTxEnvelope {
    pub fn payload_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.payload)
    }
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConfigTx {
    pub user_id: String,
    pub tx_id: String,
    /// Version of the config the submitter read before proposing the change.
    pub read_old_config_version: Version,
    pub new_config: ClusterConfig,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConfigTxEnvelope {
    pub payload: ConfigTx,
    pub signature: Vec<u8>,
}

impl ConfigTxEnvelope {
    pub fn payload_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.payload)
    }
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DbAdminTx {
    pub user_id: String,
    pub tx_id: String,
    pub create_dbs: Vec<String>,
    pub delete_dbs: Vec<String>,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DbAdminTxEnvelope {
    pub payload: DbAdminTx,
    pub signature: Vec<u8>,
}

impl DbAdminTxEnvelope {
    pub fn payload_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.payload)
    }
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UserWrite {
    pub user: User,
    pub acl: Option<AccessControl>,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UserAdminTx {
    pub user_id: String,
    pub tx_id: String,
    pub user_writes: Vec<UserWrite>,
    pub user_deletes: Vec<String>,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UserAdminTxEnvelope {
    pub payload: UserAdminTx,
    pub signature: Vec<u8>,
}

impl UserAdminTxEnvelope {
    pub fn payload_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.payload)
    }
}

/// Any of the four transaction kinds accepted for submission.
#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum Transaction {
    Data(DataTxEnvelope),
    Config(ConfigTxEnvelope),
    DbAdmin(DbAdminTxEnvelope),
    UserAdmin(UserAdminTxEnvelope),
}

impl Transaction {
    pub fn tx_id(&self) -> &str {
        match self {
            Transaction::Data(env) => &env.payload.tx_id,
            Transaction::Config(env) => &env.payload.tx_id,
            Transaction::DbAdmin(env) => &env.payload.tx_id,
            Transaction::UserAdmin(env) => &env.payload.tx_id,
        }
    }

    /// Administrative transactions are batched one per block.
    pub fn is_admin(&self) -> bool {
        !matches!(self, Transaction::Data(_))
    }

    /// The user the transaction is attributed to in the provenance store.
    pub fn submitted_by(&self) -> &str {
        match self {
            Transaction::Data(env) => {
                env.payload.must_sign_user_ids.first().map(String::as_str).unwrap_or("")
            }
            Transaction::Config(env) => &env.payload.user_id,
            Transaction::DbAdmin(env) => &env.payload.user_id,
            Transaction::UserAdmin(env) => &env.payload.user_id,
        }
    }
}

/// Proof that a transaction was committed at a known position in the ledger.
#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub header: BlockHeader,
    pub tx_index: u64,
}

/// Canonical marshalling covered by envelope signatures.
pub fn canonical_bytes<T: BorshSerialize>(payload: &T) -> Vec<u8> {
    borsh::to_vec(payload).expect("borsh serialization should not fail")
}
