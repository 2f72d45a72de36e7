use borsh::{BorshDeserialize, BorshSerialize};

/// Validation outcome of a transaction, recorded on the block header and
/// immutable once the block is committed.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
)]
pub enum Flag {
    #[strum(serialize = "VALID")]
    Valid,
    /// A required signature is missing or does not verify.
    #[strum(serialize = "INVALID_SIGNATURE")]
    InvalidSignature,
    /// The submitting user lacks a database privilege or a record ACL denies
    /// the operation.
    #[strum(serialize = "INVALID_NO_PERMISSION")]
    InvalidNoPermission,
    /// A read-set version no longer matches the committed version.
    #[strum(serialize = "INVALID_MVCC_CONFLICT")]
    InvalidMvccConflict,
    /// The transaction touches a key already written or deleted by an earlier
    /// valid transaction in the same block.
    #[strum(serialize = "INVALID_MVCC_CONFLICT_WITHIN_BLOCK")]
    InvalidMvccConflictWithinBlock,
    /// Malformed transaction contents: empty tx id, unknown database,
    /// duplicate keys, and similar schema violations.
    #[strum(serialize = "INVALID_INCORRECT_ENTRIES")]
    InvalidIncorrectEntries,
    /// An administrative transaction submitted by a non-admin user.
    #[strum(serialize = "INVALID_UNAUTHORISED_ADMIN")]
    InvalidUnauthorisedAdmin,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ValidationInfo {
    pub flag: Flag,
    pub reason: String,
}

impl ValidationInfo {
    pub fn valid() -> Self {
        ValidationInfo { flag: Flag::Valid, reason: String::new() }
    }

    pub fn invalid(flag: Flag, reason: impl Into<String>) -> Self {
        ValidationInfo { flag, reason: reason.into() }
    }

    pub fn is_valid(&self) -> bool {
        self.flag == Flag::Valid
    }
}
