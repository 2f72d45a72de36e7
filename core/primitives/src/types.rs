use borsh::{BorshDeserialize, BorshSerialize};
use ledger_crypto::PublicKey;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type BlockNum = u64;
pub type TxNum = u64;

/// Reserved database holding user records, keyed by [`user_key`].
pub const USERS_DB: &str = "_users";
/// Reserved database holding the cluster configuration under [`CONFIG_KEY`].
pub const CONFIG_DB: &str = "_config";
/// Reserved database acting as the catalogue of user databases. A key in this
/// database is a database name; the value is its optional index definition.
pub const DATABASES_DB: &str = "_dbs";
/// Reserved database for store-internal metadata such as the last committed
/// block number.
pub const METADATA_DB: &str = "_metadata";
/// Pre-created database available to clients without administrative setup.
pub const DEFAULT_DB: &str = "defaultdb";

/// Key in [`CONFIG_DB`] under which the cluster configuration is committed.
pub const CONFIG_KEY: &str = "config";

const USER_KEY_PREFIX: &str = "user:";

pub fn system_dbs() -> [&'static str; 4] {
    [USERS_DB, CONFIG_DB, DATABASES_DB, METADATA_DB]
}

pub fn is_system_db(db_name: &str) -> bool {
    system_dbs().contains(&db_name)
}

/// Worldstate key of a user record inside [`USERS_DB`].
pub fn user_key(user_id: &str) -> String {
    format!("{USER_KEY_PREFIX}{user_id}")
}

pub fn user_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(USER_KEY_PREFIX)
}

/// A database name is non-empty and restricted to `[0-9A-Za-z_.-]`.
pub fn valid_db_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

/// Position of a transaction in the ledger. `(0, 0)` means "unset", e.g. the
/// read version of a key that did not exist.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
)]
pub struct Version {
    pub block_num: BlockNum,
    pub tx_num: TxNum,
}

impl Version {
    pub fn new(block_num: BlockNum, tx_num: TxNum) -> Self {
        Version { block_num, tx_num }
    }

    pub fn is_unset(&self) -> bool {
        *self == Version::default()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_num, self.tx_num)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Per-record access control. Empty user sets leave the record open to every
/// user that holds the corresponding database privilege.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Default,
)]
pub struct AccessControl {
    pub read_users: BTreeSet<String>,
    pub read_write_users: BTreeSet<String>,
}

impl AccessControl {
    pub fn can_read(&self, user_id: &str) -> bool {
        (self.read_users.is_empty() && self.read_write_users.is_empty())
            || self.read_users.contains(user_id)
            || self.read_write_users.contains(user_id)
    }

    pub fn can_write(&self, user_id: &str) -> bool {
        self.read_write_users.is_empty() || self.read_write_users.contains(user_id)
    }
}

#[derive(
    BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq, Default,
)]
pub struct Metadata {
    pub version: Version,
    pub access_control: Option<AccessControl>,
}

/// The unit of storage in the state store: value bytes plus the version and
/// access control under which they were committed.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ValueWithMetadata {
    pub value: Vec<u8>,
    pub metadata: Metadata,
}

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct KvWithMetadata {
    pub key: String,
    pub value: Vec<u8>,
    pub metadata: Metadata,
}

/// Database privilege levels a user can hold.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
)]
pub enum Access {
    Read,
    ReadWrite,
}

#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Default,
)]
pub struct Privilege {
    pub db_permission: BTreeMap<String, Access>,
    /// Admins may submit config, database and user administration
    /// transactions and may read the ledger without per-db grants.
    pub admin: bool,
}

impl Privilege {
    pub fn can_read_db(&self, db_name: &str) -> bool {
        self.admin || self.db_permission.contains_key(db_name)
    }

    pub fn can_write_db(&self, db_name: &str) -> bool {
        self.admin || matches!(self.db_permission.get(db_name), Some(Access::ReadWrite))
    }
}

/// A registered ledger user: the identity the validator checks signatures and
/// permissions against. Stored in [`USERS_DB`].
#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
pub struct User {
    pub id: String,
    pub verifying_key: PublicKey,
    pub privilege: Privilege,
}
