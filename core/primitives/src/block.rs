use crate::hash::{hash, hash_borsh, CryptoHash};
use crate::transaction::{
    canonical_bytes, ConfigTxEnvelope, DataTxEnvelope, DbAdminTxEnvelope, UserAdminTxEnvelope,
};
use crate::types::BlockNum;
use crate::validation::ValidationInfo;
use borsh::{BorshDeserialize, BorshSerialize};

/// The part of the header fixed at proposal time, before validation runs.
#[derive(
    BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq, Default,
)]
pub struct BlockHeaderBase {
    /// 1-based, contiguous, monotonically increasing. Block 1 is genesis.
    pub number: BlockNum,
    /// Hash of block N-1's base header.
    pub previous_base_header_hash: CryptoHash,
    /// Full hash of the last block committed when this block was proposed.
    pub last_committed_block_hash: CryptoHash,
    pub last_committed_block_num: BlockNum,
}

#[derive(
    BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq, Default,
)]
pub struct BlockHeader {
    pub base_header: BlockHeaderBase,
    /// `skipchain_hashes[k]` is the full hash of block `N - 2^k`, for every k
    /// with `N - 2^k >= 1`. Index 0 therefore always links block N-1.
    pub skipchain_hashes: Vec<CryptoHash>,
    pub tx_merkle_root: CryptoHash,
    pub validation_info: Vec<ValidationInfo>,
}

impl BlockHeader {
    pub fn number(&self) -> BlockNum {
        self.base_header.number
    }

    /// Hash of the base header alone. This is what `previous_base_header_hash`
    /// of the next block commits to.
    pub fn base_hash(&self) -> CryptoHash {
        hash_borsh(&self.base_header)
    }

    /// Full block hash: `H(baseHeaderBytes || txMerkleRoot ||
    /// validationInfoBytes || skipchainHashesBytes)`. Transaction contents are
    /// committed through the Merkle root.
    pub fn block_hash(&self) -> CryptoHash {
        let mut data = canonical_bytes(&self.base_header);
        data.extend_from_slice(self.tx_merkle_root.as_bytes());
        data.extend_from_slice(&canonical_bytes(&self.validation_info));
        data.extend_from_slice(&canonical_bytes(&self.skipchain_hashes));
        hash(&data)
    }
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum BlockPayload {
    DataTxs(Vec<DataTxEnvelope>),
    ConfigTx(ConfigTxEnvelope),
    DbAdminTx(DbAdminTxEnvelope),
    UserAdminTx(UserAdminTxEnvelope),
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: BlockPayload,
}

impl Block {
    pub fn number(&self) -> BlockNum {
        self.header.base_header.number
    }

    pub fn tx_count(&self) -> usize {
        match &self.payload {
            BlockPayload::DataTxs(envelopes) => envelopes.len(),
            _ => 1,
        }
    }

    /// Transaction ids in block order.
    pub fn tx_ids(&self) -> Vec<String> {
        match &self.payload {
            BlockPayload::DataTxs(envelopes) => {
                envelopes.iter().map(|env| env.payload.tx_id.clone()).collect()
            }
            BlockPayload::ConfigTx(env) => vec![env.payload.tx_id.clone()],
            BlockPayload::DbAdminTx(env) => vec![env.payload.tx_id.clone()],
            BlockPayload::UserAdminTx(env) => vec![env.payload.tx_id.clone()],
        }
    }

    /// Canonical borsh encoding of the transaction at `tx_index`, as hashed
    /// into the Merkle tree leaves.
    pub fn tx_bytes(&self, tx_index: usize) -> Option<Vec<u8>> {
        match &self.payload {
            BlockPayload::DataTxs(envelopes) => {
                envelopes.get(tx_index).map(|env| canonical_bytes(env))
            }
            BlockPayload::ConfigTx(env) if tx_index == 0 => Some(canonical_bytes(env)),
            BlockPayload::DbAdminTx(env) if tx_index == 0 => Some(canonical_bytes(env)),
            BlockPayload::UserAdminTx(env) if tx_index == 0 => Some(canonical_bytes(env)),
            _ => None,
        }
    }
}

/// Block numbers that block `number` links to through its skipchain, in
/// ascending k: `number - 2^k` for every k with `number - 2^k >= 1`.
pub fn skip_list_links(number: BlockNum) -> Vec<BlockNum> {
    let mut links = Vec::new();
    let mut distance: u64 = 1;
    while number > distance {
        links.push(number - distance);
        distance <<= 1;
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Flag;

    #[test]
    fn skip_links() {
        assert_eq!(skip_list_links(1), Vec::<BlockNum>::new());
        assert_eq!(skip_list_links(2), vec![1]);
        assert_eq!(skip_list_links(3), vec![2, 1]);
        assert_eq!(skip_list_links(17), vec![16, 15, 13, 9, 1]);
        assert_eq!(skip_list_links(16), vec![15, 14, 12, 8]);
    }

    fn test_header() -> BlockHeader {
        BlockHeader {
            base_header: BlockHeaderBase {
                number: 2,
                previous_base_header_hash: hash(b"base1"),
                last_committed_block_hash: hash(b"full1"),
                last_committed_block_num: 1,
            },
            skipchain_hashes: vec![hash(b"full1")],
            tx_merkle_root: hash(b"root"),
            validation_info: vec![ValidationInfo::valid()],
        }
    }

    #[test]
    fn block_hash_covers_validation_info_and_links() {
        let header = test_header();
        let original = header.block_hash();

        let mut flagged = header.clone();
        flagged.validation_info =
            vec![ValidationInfo::invalid(Flag::InvalidSignature, "missing signer")];
        assert_ne!(original, flagged.block_hash());

        let mut relinked = header.clone();
        relinked.skipchain_hashes = vec![hash(b"other")];
        assert_ne!(original, relinked.block_hash());

        // The base hash ignores both.
        assert_eq!(header.base_hash(), flagged.base_hash());
        assert_eq!(header.base_hash(), relinked.base_hash());
    }
}
