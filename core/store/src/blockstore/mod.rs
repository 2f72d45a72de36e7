use ledger_primitives::block::{skip_list_links, Block, BlockHeader};
use ledger_primitives::hash::CryptoHash;
use ledger_primitives::types::BlockNum;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Fixed-width index record:
/// `block_num u64 | segment u32 | offset u64 | full_hash 32B | base_hash 32B`.
const INDEX_RECORD_LEN: u64 = 8 + 4 + 8 + 32 + 32;
const LEN_PREFIX: u64 = 4;

const INDEX_FILE: &str = "index";

const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 << 20;

#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
    #[error("block store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("requested block number [{block_num}] cannot be greater than the last committed block number [{height}]")]
    NotFound { block_num: BlockNum, height: BlockNum },
    #[error("expected block number [{expected}], got [{got}]")]
    NonContiguousBlock { got: BlockNum, expected: BlockNum },
    #[error("can't find path from block [{start}] up to block [{end}]")]
    InvertedRange { start: BlockNum, end: BlockNum },
    #[error("block store corruption: {0}")]
    Corruption(String),
}

pub struct BlockStoreConfig {
    pub dir: PathBuf,
    pub max_segment_size: u64,
}

impl BlockStoreConfig {
    pub fn new(dir: PathBuf) -> Self {
        BlockStoreConfig { dir, max_segment_size: DEFAULT_MAX_SEGMENT_SIZE }
    }
}

struct Writer {
    index: File,
    segment: File,
    segment_num: u32,
    segment_len: u64,
}

/// Append-only block log. Blocks live in size-bounded segment files as
/// `u32`-length-prefixed borsh records; the index file maps a block number to
/// its segment and offset along with both block hashes. The index write is
/// the commit point: on open, data past the last complete index record is
/// discarded.
pub struct BlockStore {
    dir: PathBuf,
    index_read: File,
    writer: Mutex<Writer>,
    height: AtomicU64,
    max_segment_size: u64,
}

struct IndexRecord {
    block_num: BlockNum,
    segment_num: u32,
    offset: u64,
    full_hash: CryptoHash,
    base_hash: CryptoHash,
}

impl BlockStore {
    pub fn open(config: BlockStoreConfig) -> Result<Self, BlockStoreError> {
        std::fs::create_dir_all(&config.dir)?;
        let index_path = config.dir.join(INDEX_FILE);
        let index =
            OpenOptions::new().read(true).append(true).create(true).open(&index_path)?;

        let index_len = index.metadata()?.len();
        let height = index_len / INDEX_RECORD_LEN;
        if index_len % INDEX_RECORD_LEN != 0 {
            warn!(target: "blockstore", index_len, "truncating partial index record");
            index.set_len(height * INDEX_RECORD_LEN)?;
        }
        let index_read = File::open(&index_path)?;

        let writer = if height > 0 {
            let tail = read_record_at(&index_read, height, height)?;
            let segment = OpenOptions::new()
                .read(true)
                .append(true)
                .open(segment_path(&config.dir, tail.segment_num))?;
            let block_len = read_len_prefix(&segment, tail.offset)?;
            let data_end = tail.offset + LEN_PREFIX + u64::from(block_len);
            if segment.metadata()?.len() > data_end {
                warn!(target: "blockstore", data_end, "truncating partial block record");
                segment.set_len(data_end)?;
            }
            Writer { index, segment, segment_num: tail.segment_num, segment_len: data_end }
        } else {
            let segment = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(segment_path(&config.dir, 0))?;
            segment.set_len(0)?;
            Writer { index, segment, segment_num: 0, segment_len: 0 }
        };

        info!(target: "blockstore", height, dir = %config.dir.display(), "opened block store");
        Ok(BlockStore {
            dir: config.dir,
            index_read,
            writer: Mutex::new(writer),
            height: AtomicU64::new(height),
            max_segment_size: config.max_segment_size,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn height(&self) -> BlockNum {
        self.height.load(Ordering::Acquire)
    }

    /// Appends the next block. The block number must be exactly `height + 1`;
    /// the data write is synced before the index record, making the index the
    /// commit point.
    pub fn append(&self, block: &Block) -> Result<(), BlockStoreError> {
        let mut writer = self.writer.lock();
        let expected = self.height() + 1;
        if block.number() != expected {
            return Err(BlockStoreError::NonContiguousBlock {
                got: block.number(),
                expected,
            });
        }

        let data = borsh::to_vec(block).expect("borsh serialization should not fail");
        let record_len = LEN_PREFIX + data.len() as u64;
        if writer.segment_len > 0 && writer.segment_len + record_len > self.max_segment_size {
            let next = writer.segment_num + 1;
            let segment = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(segment_path(&self.dir, next))?;
            segment.set_len(0)?;
            debug!(target: "blockstore", segment_num = next, "rolled over to new segment");
            writer.segment = segment;
            writer.segment_num = next;
            writer.segment_len = 0;
        }

        let offset = writer.segment_len;
        let mut buf = Vec::with_capacity(record_len as usize);
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&data);
        let segment = &mut writer.segment;
        segment.write_all(&buf)?;
        segment.sync_data()?;

        let mut record = Vec::with_capacity(INDEX_RECORD_LEN as usize);
        record.extend_from_slice(&block.number().to_le_bytes());
        record.extend_from_slice(&writer.segment_num.to_le_bytes());
        record.extend_from_slice(&offset.to_le_bytes());
        record.extend_from_slice(block.header.block_hash().as_bytes());
        record.extend_from_slice(block.header.base_hash().as_bytes());
        writer.index.write_all(&record)?;
        writer.index.sync_data()?;

        writer.segment_len += record_len;
        self.height.store(expected, Ordering::Release);
        debug!(target: "blockstore", block_num = expected, offset, "appended block");
        Ok(())
    }

    fn read_index_record(&self, block_num: BlockNum) -> Result<IndexRecord, BlockStoreError> {
        read_record_at(&self.index_read, block_num, self.height())
    }

    pub fn get(&self, block_num: BlockNum) -> Result<Block, BlockStoreError> {
        let record = self.read_index_record(block_num)?;
        let segment = File::open(segment_path(&self.dir, record.segment_num))?;
        let block_len = read_len_prefix(&segment, record.offset)?;
        let mut data = vec![0u8; block_len as usize];
        segment.read_exact_at(&mut data, record.offset + LEN_PREFIX)?;
        borsh::from_slice(&data).map_err(|err| {
            BlockStoreError::Corruption(format!("block {block_num} does not decode: {err}"))
        })
    }

    pub fn get_header(&self, block_num: BlockNum) -> Result<BlockHeader, BlockStoreError> {
        Ok(self.get(block_num)?.header)
    }

    /// Full block hash as committed to the index at append time.
    pub fn get_hash(&self, block_num: BlockNum) -> Result<CryptoHash, BlockStoreError> {
        Ok(self.read_index_record(block_num)?.full_hash)
    }

    pub fn get_base_header_hash(
        &self,
        block_num: BlockNum,
    ) -> Result<CryptoHash, BlockStoreError> {
        Ok(self.read_index_record(block_num)?.base_hash)
    }

    /// Fills in `skipchain_hashes` for a block about to be appended:
    /// `skipchain_hashes[k]` is the full hash of block `N - 2^k`. Rejected
    /// unless the block number is exactly one above the stored height.
    pub fn add_skip_list_links(&self, block: &mut Block) -> Result<(), BlockStoreError> {
        let expected = self.height() + 1;
        if block.number() != expected {
            return Err(BlockStoreError::NonContiguousBlock {
                got: block.number(),
                expected,
            });
        }
        let mut hashes = vec![];
        for linked in skip_list_links(block.number()) {
            hashes.push(self.get_hash(linked)?);
        }
        block.header.skipchain_hashes = hashes;
        Ok(())
    }

    /// Shortest skip-list chain from `end` back to `start`, inclusive on both
    /// ends. The descent from the current block follows the longest link
    /// whose distance `2^k` divides the current block number and does not
    /// overshoot `start`; the immediate predecessor link always qualifies, so
    /// the walk terminates.
    pub fn get_path(
        &self,
        start: BlockNum,
        end: BlockNum,
    ) -> Result<Vec<Block>, BlockStoreError> {
        if start == 0 || start > end {
            return Err(BlockStoreError::InvertedRange { start, end });
        }
        let height = self.height();
        if end > height {
            return Err(BlockStoreError::NotFound { block_num: end, height });
        }
        let mut path = vec![self.get(end)?];
        let mut current = end;
        while current > start {
            let mut distance = 1u64 << current.trailing_zeros();
            while current - distance < start {
                distance >>= 1;
            }
            current -= distance;
            path.push(self.get(current)?);
        }
        Ok(path)
    }
}

fn read_len_prefix(segment: &File, offset: u64) -> Result<u32, BlockStoreError> {
    let mut buf = [0u8; LEN_PREFIX as usize];
    segment.read_exact_at(&mut buf, offset)?;
    Ok(u32::from_le_bytes(buf))
}

fn segment_path(dir: &Path, segment_num: u32) -> PathBuf {
    dir.join(format!("segment-{segment_num:06}"))
}

fn read_record_at(
    index: &File,
    block_num: BlockNum,
    height: BlockNum,
) -> Result<IndexRecord, BlockStoreError> {
    if block_num == 0 || block_num > height {
        return Err(BlockStoreError::NotFound { block_num, height });
    }
    let mut buf = [0u8; INDEX_RECORD_LEN as usize];
    index.read_exact_at(&mut buf, (block_num - 1) * INDEX_RECORD_LEN)?;
    let record = IndexRecord {
        block_num: u64::from_le_bytes(buf[0..8].try_into().expect("fixed slice")),
        segment_num: u32::from_le_bytes(buf[8..12].try_into().expect("fixed slice")),
        offset: u64::from_le_bytes(buf[12..20].try_into().expect("fixed slice")),
        full_hash: CryptoHash(buf[20..52].try_into().expect("fixed slice")),
        base_hash: CryptoHash(buf[52..84].try_into().expect("fixed slice")),
    };
    if record.block_num != block_num {
        return Err(BlockStoreError::Corruption(format!(
            "index record for block {} carries block number {}",
            block_num, record.block_num
        )));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ledger_primitives::block::{BlockHeaderBase, BlockPayload};
    use ledger_primitives::merkle::build_tree_for_block_tx;
    use ledger_primitives::transaction::{DataTx, DataTxEnvelope};
    use ledger_primitives::validation::ValidationInfo;
    use std::collections::BTreeMap;

    fn open(dir: &Path) -> BlockStore {
        BlockStore::open(BlockStoreConfig::new(dir.join("blockstore"))).unwrap()
    }

    /// Builds the next block of the chain with proper header linkage, the way
    /// the block creator does before handing it to the store.
    fn next_block(store: &BlockStore, tx_id: &str) -> Block {
        let height = store.height();
        let base_header = if height == 0 {
            BlockHeaderBase { number: 1, ..Default::default() }
        } else {
            BlockHeaderBase {
                number: height + 1,
                previous_base_header_hash: store.get_base_header_hash(height).unwrap(),
                last_committed_block_hash: store.get_hash(height).unwrap(),
                last_committed_block_num: height,
            }
        };
        let envelope = DataTxEnvelope {
            payload: DataTx {
                must_sign_user_ids: vec!["testUser".to_string()],
                tx_id: tx_id.to_string(),
                db_operations: vec![],
            },
            signatures: BTreeMap::new(),
        };
        let mut block = Block {
            header: BlockHeader {
                base_header,
                skipchain_hashes: vec![],
                tx_merkle_root: CryptoHash::default(),
                validation_info: vec![ValidationInfo::valid()],
            },
            payload: BlockPayload::DataTxs(vec![envelope]),
        };
        block.header.tx_merkle_root = build_tree_for_block_tx(&block).unwrap();
        store.add_skip_list_links(&mut block).unwrap();
        block
    }

    fn build_chain(store: &BlockStore, blocks: u64) {
        for i in 0..blocks {
            let block = next_block(store, &format!("tx{i}"));
            store.append(&block).unwrap();
        }
    }

    #[test]
    fn append_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        build_chain(&store, 3);

        assert_eq!(store.height(), 3);
        for num in 1..=3 {
            let block = store.get(num).unwrap();
            assert_eq!(block.number(), num);
            assert_eq!(store.get_hash(num).unwrap(), block.header.block_hash());
            assert_eq!(store.get_base_header_hash(num).unwrap(), block.header.base_hash());
        }
        assert_matches!(store.get(4), Err(BlockStoreError::NotFound { block_num: 4, height: 3 }));
        assert_matches!(store.get(0), Err(BlockStoreError::NotFound { .. }));
    }

    #[test]
    fn header_linkage_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        build_chain(&store, 8);

        for num in 2..=8 {
            let header = store.get_header(num).unwrap();
            let prev = store.get_header(num - 1).unwrap();
            assert_eq!(header.base_header.previous_base_header_hash, prev.base_hash());
            assert_eq!(header.base_header.last_committed_block_num, num - 1);
            assert_eq!(header.skipchain_hashes[0], prev.block_hash());
            // Every skip link points at the right block's full hash.
            for (k, linked) in skip_list_links(num).into_iter().enumerate() {
                assert_eq!(
                    header.skipchain_hashes[k],
                    store.get_hash(linked).unwrap(),
                    "block {num} link {k}"
                );
            }
        }
    }

    #[test]
    fn rejects_non_contiguous_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        build_chain(&store, 2);
        let mut block = next_block(&store, "tx-gap");
        block.header.base_header.number = 5;
        assert_matches!(
            store.append(&block),
            Err(BlockStoreError::NonContiguousBlock { got: 5, expected: 3 })
        );
        assert_matches!(
            store.add_skip_list_links(&mut block),
            Err(BlockStoreError::NonContiguousBlock { got: 5, expected: 3 })
        );
    }

    #[test]
    fn reopen_preserves_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let before: Vec<Block>;
        {
            let store = open(dir.path());
            build_chain(&store, 5);
            before = (1..=5).map(|num| store.get(num).unwrap()).collect();
        }
        let store = open(dir.path());
        assert_eq!(store.height(), 5);
        for block in &before {
            assert_eq!(store.get(block.number()).unwrap(), *block);
        }
        // And the store keeps appending from where it left off.
        build_chain(&store, 1);
        assert_eq!(store.height(), 6);
    }

    #[test]
    fn partial_tail_writes_are_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            build_chain(&store, 3);
        }
        let blockstore_dir = dir.path().join("blockstore");
        // A torn index record and trailing segment garbage from a crashed
        // append must both disappear on reopen.
        let mut index =
            OpenOptions::new().append(true).open(blockstore_dir.join(INDEX_FILE)).unwrap();
        index.write_all(&[0xAB; 20]).unwrap();
        let mut segment =
            OpenOptions::new().append(true).open(blockstore_dir.join("segment-000000")).unwrap();
        segment.write_all(&[0xCD; 100]).unwrap();
        drop((index, segment));

        let store = open(dir.path());
        assert_eq!(store.height(), 3);
        build_chain(&store, 1);
        assert_eq!(store.get(4).unwrap().number(), 4);
    }

    #[test]
    fn segments_roll_over_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(BlockStoreConfig {
            dir: dir.path().join("blockstore"),
            max_segment_size: 512,
        })
        .unwrap();
        build_chain(&store, 10);
        let segments = std::fs::read_dir(store.dir())
            .unwrap()
            .filter(|entry| {
                entry.as_ref().unwrap().file_name().to_string_lossy().starts_with("segment-")
            })
            .count();
        assert!(segments > 1, "expected rollover, got {segments} segment(s)");
        for num in 1..=10 {
            assert_eq!(store.get(num).unwrap().number(), num);
        }

        // Reopen lands on the right tail segment.
        drop(store);
        let store = BlockStore::open(BlockStoreConfig {
            dir: dir.path().join("blockstore"),
            max_segment_size: 512,
        })
        .unwrap();
        build_chain(&store, 1);
        assert_eq!(store.height(), 11);
    }

    #[test]
    fn path_17_down_to_2() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        build_chain(&store, 17);

        let numbers: Vec<BlockNum> =
            store.get_path(2, 17).unwrap().iter().map(Block::number).collect();
        assert_eq!(numbers, vec![17, 16, 8, 4, 2]);

        // Every consecutive pair is connected by a stored skip link.
        let path = store.get_path(2, 17).unwrap();
        for pair in path.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let k = skip_list_links(from.number())
                .iter()
                .position(|linked| *linked == to.number())
                .expect("consecutive path blocks must be linked");
            assert_eq!(from.header.skipchain_hashes[k], to.header.block_hash());
        }
    }

    #[test]
    fn path_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        build_chain(&store, 6);

        let single: Vec<BlockNum> =
            store.get_path(4, 4).unwrap().iter().map(Block::number).collect();
        assert_eq!(single, vec![4]);

        let from_genesis: Vec<BlockNum> =
            store.get_path(1, 6).unwrap().iter().map(Block::number).collect();
        assert_eq!(from_genesis.first(), Some(&6));
        assert_eq!(from_genesis.last(), Some(&1));

        assert_matches!(
            store.get_path(6, 2),
            Err(BlockStoreError::InvertedRange { start: 6, end: 2 })
        );
        assert_matches!(
            store.get_path(2, 117),
            Err(BlockStoreError::NotFound { block_num: 117, height: 6 })
        );
        assert_matches!(store.get_path(0, 3), Err(BlockStoreError::InvertedRange { .. }));
    }
}
