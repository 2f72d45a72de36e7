use crate::block::Block;
use crate::hash::{combine_hash, hash, CryptoHash};
use crate::transaction::canonical_bytes;
use crate::validation::ValidationInfo;
use borsh::{BorshDeserialize, BorshSerialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MerkleError {
    #[error("node with index {index} is not part of merkle tree (0, {max})")]
    IndexOutOfBounds { index: u64, max: u64 },
    #[error("block carries {got} validation entries for {expected} transactions")]
    ValidationInfoMismatch { expected: usize, got: usize },
}

/// Which side of the current node the sibling hash sits on. This is the
/// documented proof convention: the verifier concatenates `sibling || node`
/// for `Left` and `node || sibling` for `Right`.
#[derive(
    BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Copy, Debug, PartialEq, Eq,
)]
pub enum Direction {
    Left,
    Right,
}

#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct MerklePathItem {
    pub hash: CryptoHash,
    pub direction: Direction,
}

pub type MerklePath = Vec<MerklePathItem>;

/// Inclusion proof for one transaction of a block: the leaf hash followed by
/// the sibling hashes up to (excluding) the root.
#[derive(BorshSerialize, BorshDeserialize, serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TxProof {
    pub leaf_hash: CryptoHash,
    pub path: MerklePath,
}

/// Leaf `i` of the tx tree commits to the transaction bytes together with its
/// validation outcome: `H(marshal(tx) || marshal(validationInfo[i]))`.
pub fn tx_leaf_hash(tx_bytes: &[u8], validation_info: &ValidationInfo) -> CryptoHash {
    let mut data = tx_bytes.to_vec();
    data.extend_from_slice(&canonical_bytes(validation_info));
    hash(&data)
}

/// Builds the binary tree over `leaves` and returns the root along with the
/// path of every leaf. A level of odd width duplicates its last node, so that
/// node's parent is `H(last || last)`.
pub fn merklize(leaves: &[CryptoHash]) -> (CryptoHash, Vec<MerklePath>) {
    if leaves.is_empty() {
        return (CryptoHash::default(), Vec::new());
    }
    let mut paths = vec![MerklePath::new(); leaves.len()];
    let mut level: Vec<CryptoHash> = leaves.to_vec();
    let mut depth = 0usize;
    while level.len() > 1 {
        for (leaf_index, path) in paths.iter_mut().enumerate() {
            let node_index = leaf_index >> depth;
            if node_index % 2 == 0 {
                let sibling =
                    if node_index + 1 < level.len() { node_index + 1 } else { node_index };
                path.push(MerklePathItem { hash: level[sibling], direction: Direction::Right });
            } else {
                path.push(MerklePathItem { hash: level[node_index - 1], direction: Direction::Left });
            }
        }
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(combine_hash(left, right));
        }
        level = next;
        depth += 1;
    }
    (level[0], paths)
}

/// Folds `path` starting from `leaf_hash` and checks the result against
/// `root`.
pub fn verify_path(root: &CryptoHash, path: &MerklePath, leaf_hash: &CryptoHash) -> bool {
    let mut node = *leaf_hash;
    for item in path {
        node = match item.direction {
            Direction::Left => combine_hash(&item.hash, &node),
            Direction::Right => combine_hash(&node, &item.hash),
        };
    }
    node == *root
}

fn block_leaves(block: &Block) -> Result<Vec<CryptoHash>, MerkleError> {
    let tx_count = block.tx_count();
    let validation_info = &block.header.validation_info;
    if validation_info.len() != tx_count {
        return Err(MerkleError::ValidationInfoMismatch {
            expected: tx_count,
            got: validation_info.len(),
        });
    }
    let mut leaves = Vec::with_capacity(tx_count);
    for tx_index in 0..tx_count {
        let tx_bytes = block.tx_bytes(tx_index).expect("tx_index bounded by tx_count");
        leaves.push(tx_leaf_hash(&tx_bytes, &validation_info[tx_index]));
    }
    Ok(leaves)
}

/// Root of the tx tree for `block`. Validation info must already be set on the
/// header since the leaves commit to it.
pub fn build_tree_for_block_tx(block: &Block) -> Result<CryptoHash, MerkleError> {
    Ok(merklize(&block_leaves(block)?).0)
}

/// Inclusion proof for the transaction at `tx_index` of `block`.
pub fn tx_proof(block: &Block, tx_index: u64) -> Result<TxProof, MerkleError> {
    let leaves = block_leaves(block)?;
    let index = usize::try_from(tx_index)
        .ok()
        .filter(|index| *index < leaves.len())
        .ok_or(MerkleError::IndexOutOfBounds {
            index: tx_index,
            max: (leaves.len() as u64).saturating_sub(1),
        })?;
    let (_, mut paths) = merklize(&leaves);
    Ok(TxProof { leaf_hash: leaves[index], path: paths.swap_remove(index) })
}

/// Verifier-side check: recomputes the leaf from the claimed transaction and
/// validation outcome, then folds the path against the committed root.
pub fn verify_tx_proof(
    proof: &TxProof,
    tx_bytes: &[u8],
    validation_info: &ValidationInfo,
    root: &CryptoHash,
) -> bool {
    proof.leaf_hash == tx_leaf_hash(tx_bytes, validation_info)
        && verify_path(root, &proof.path, &proof.leaf_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, BlockPayload};
    use crate::transaction::{DataTx, DataTxEnvelope};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn leaves(n: usize) -> Vec<CryptoHash> {
        (0..n).map(|i| hash(format!("leaf{i}").as_bytes())).collect()
    }

    #[test]
    fn single_leaf_is_root() {
        let leaves = leaves(1);
        let (root, paths) = merklize(&leaves);
        assert_eq!(root, leaves[0]);
        assert!(paths[0].is_empty());
    }

    #[test]
    fn odd_level_duplicates_last_node() {
        let leaves = leaves(3);
        let (root, _) = merklize(&leaves);
        let left = combine_hash(&leaves[0], &leaves[1]);
        let right = combine_hash(&leaves[2], &leaves[2]);
        assert_eq!(root, combine_hash(&left, &right));
    }

    #[test]
    fn every_path_verifies() {
        for n in 1..=9 {
            let leaves = leaves(n);
            let (root, paths) = merklize(&leaves);
            for (i, path) in paths.iter().enumerate() {
                assert!(verify_path(&root, path, &leaves[i]), "n={n} i={i}");
                // A path does not verify against the wrong leaf.
                if n > 1 {
                    let wrong = leaves[(i + 1) % n];
                    assert!(!verify_path(&root, path, &wrong), "n={n} i={i}");
                }
            }
        }
    }

    fn data_block(tx_count: usize) -> Block {
        let envelopes = (0..tx_count)
            .map(|i| DataTxEnvelope {
                payload: DataTx {
                    must_sign_user_ids: vec!["alice".to_string()],
                    tx_id: format!("tx{i}"),
                    db_operations: vec![],
                },
                signatures: BTreeMap::new(),
            })
            .collect();
        let mut block =
            Block { header: BlockHeader::default(), payload: BlockPayload::DataTxs(envelopes) };
        block.header.base_header.number = 5;
        block.header.validation_info = vec![ValidationInfo::valid(); tx_count];
        block
    }

    #[test]
    fn block_proof_round_trip() {
        let mut block = data_block(5);
        block.header.tx_merkle_root = build_tree_for_block_tx(&block).unwrap();
        for tx_index in 0..5u64 {
            let proof = tx_proof(&block, tx_index).unwrap();
            // Three siblings for a five-leaf tree.
            assert_eq!(proof.path.len(), 3);
            let tx_bytes = block.tx_bytes(tx_index as usize).unwrap();
            assert!(verify_tx_proof(
                &proof,
                &tx_bytes,
                &block.header.validation_info[tx_index as usize],
                &block.header.tx_merkle_root,
            ));
            // Proof does not verify a different transaction.
            let other_bytes = block.tx_bytes(((tx_index + 1) % 5) as usize).unwrap();
            assert!(!verify_tx_proof(
                &proof,
                &other_bytes,
                &block.header.validation_info[tx_index as usize],
                &block.header.tx_merkle_root,
            ));
        }
    }

    #[test]
    fn out_of_range_index() {
        let block = data_block(3);
        assert_matches!(
            tx_proof(&block, 100),
            Err(MerkleError::IndexOutOfBounds { index: 100, max: 2 })
        );
    }

    #[test]
    fn validation_info_must_match_tx_count() {
        let mut block = data_block(3);
        block.header.validation_info.pop();
        assert_matches!(
            build_tree_for_block_tx(&block),
            Err(MerkleError::ValidationInfoMismatch { expected: 3, got: 2 })
        );
    }
}
