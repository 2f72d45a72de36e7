use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest used for every hash commitment in the ledger: base header
/// hashes, full block hashes, skipchain links and Merkle tree nodes.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
)]
pub struct CryptoHash(pub [u8; 32]);

impl CryptoHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

/// Computes the SHA-256 digest of `data`.
pub fn hash(data: &[u8]) -> CryptoHash {
    CryptoHash(sha2::Sha256::digest(data).into())
}

/// Hash of the concatenation `left || right`. Parent node computation for the
/// Merkle tx tree.
pub fn combine_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&left.0);
    data[32..].copy_from_slice(&right.0);
    hash(&data)
}

/// Hash of the canonical borsh encoding of `value`.
pub fn hash_borsh<T: BorshSerialize>(value: &T) -> CryptoHash {
    hash(&borsh::to_vec(value).expect("borsh serialization should not fail"))
}

impl AsRef<[u8]> for CryptoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for CryptoHash {
    fn from(bytes: [u8; 32]) -> Self {
        CryptoHash(bytes)
    }
}

impl fmt::Display for CryptoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for CryptoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for CryptoHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = bs58::decode(s).into_vec().map_err(|err| err.to_string())?;
        let bytes: [u8; 32] =
            data.as_slice().try_into().map_err(|_| format!("invalid hash length {}", data.len()))?;
        Ok(CryptoHash(bytes))
    }
}

impl serde::Serialize for CryptoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for CryptoHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
