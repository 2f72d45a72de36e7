use ledger_primitives::types::{BlockNum, KvWithMetadata, Version};
use rocksdb::{
    ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    ReadOptions, WriteBatch, WriteOptions,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::{debug, info};

type Db = DBWithThreadMode<MultiThreaded>;

const KEY_SEPARATOR: u8 = 0x00;
const VERSION_SUFFIX_LEN: usize = 16;

/// Column families of the provenance database. Variant names are the on-disk
/// column family names, so renaming one is a breaking change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter, strum::IntoStaticStr)]
enum ProvenanceColumn {
    /// Per-key version chains.
    /// - *Rows*: `db \0 key \0 version(16B BE)`
    /// - *Content*: [`VersionChainRecord`]
    Values,
    /// Keys written by a user.
    /// - *Rows*: `user \0 db \0 key \0 version`
    /// - *Content*: empty
    WritesByUser,
    /// Keys read by a user, at the version the read observed.
    ReadsByUser,
    /// Keys deleted by a user, at the last committed version of the value.
    DeletesByUser,
    /// Read access counts per key.
    /// - *Rows*: `db \0 key \0 user`
    /// - *Content*: u64 little-endian counter
    KeyReaders,
    /// Write access counts per key.
    KeyWriters,
    /// Transaction ids submitted by a user.
    /// - *Rows*: `user \0 tx_id`
    /// - *Content*: empty
    TxSubmittedByUser,
    /// Position of a transaction in the ledger.
    /// - *Rows*: tx_id
    /// - *Content*: borsh `(block_num, tx_index)`
    TxLocator,
    /// Store-level cells.
    /// - *Rows*: single row `"height"`
    /// - *Content*: last committed block number, u64 little-endian
    Misc,
}

const HEIGHT_KEY: &[u8] = b"height";

impl ProvenanceColumn {
    fn name(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvenanceError {
    #[error("provenance storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("provenance io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction id [{tx_id}] was already committed at block {block_num}, index {tx_index}")]
    DuplicateTxId { tx_id: String, block_num: BlockNum, tx_index: u64 },
    #[error("provenance corruption: {0}")]
    Corruption(String),
}

/// One committed value of a key, linked to its neighbours in commit order.
/// The links are versions rather than pointers so previous/next queries are a
/// single point lookup per step.
#[derive(borsh::BorshSerialize, borsh::BorshDeserialize, Clone, Debug, PartialEq, Eq)]
struct VersionChainRecord {
    value: Vec<u8>,
    version: Version,
    prev: Option<Version>,
    next: Option<Version>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyWithVersion {
    pub key: String,
    pub version: Version,
}

/// Everything the committer hands to the provenance store for one
/// transaction against one database. Invalid transactions record only the
/// submitter and locator links.
#[derive(Clone, Debug, Default)]
pub struct TxDataForProvenance {
    pub db_name: String,
    pub user_id: String,
    pub tx_id: String,
    /// Position of the transaction in its block. Carried explicitly because
    /// one transaction may produce an entry per touched database.
    pub tx_index: u64,
    pub reads: Vec<KeyWithVersion>,
    pub writes: Vec<KvWithMetadata>,
    pub deletes: Vec<KeyWithVersion>,
    pub old_version_of_writes: BTreeMap<String, Version>,
    pub is_valid: bool,
}

/// Historical graph of reads, writes and deletes: per-key version chains plus
/// user-centric and key-centric secondary indexes.
pub struct ProvenanceStore {
    db: Db,
}

impl ProvenanceStore {
    pub fn open(dir: PathBuf) -> Result<Self, ProvenanceError> {
        std::fs::create_dir_all(&dir)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors: Vec<ColumnFamilyDescriptor> = ProvenanceColumn::iter()
            .map(|column| ColumnFamilyDescriptor::new(column.name(), Options::default()))
            .collect();
        let db = Db::open_cf_descriptors(&opts, &dir, descriptors)?;
        info!(target: "provenance", dir = %dir.display(), "opened provenance store");
        Ok(ProvenanceStore { db })
    }

    fn cf(&self, column: ProvenanceColumn) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db.cf_handle(column.name()).expect("column families are created on open")
    }

    /// Records one block's worth of provenance data. Re-committing the same
    /// block during recovery replay is idempotent; the same tx id at a
    /// different ledger position is a corruption-level error.
    pub fn commit(
        &self,
        block_num: BlockNum,
        tx_data: &[TxDataForProvenance],
    ) -> Result<(), ProvenanceError> {
        let mut batch = WriteBatch::default();
        // Access counters are read-modify-write; repeated bumps of the same
        // counter within this block are accumulated before touching the db.
        let mut reader_bumps: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        let mut writer_bumps: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for data in tx_data {
            self.check_duplicate_tx_id(data, block_num)?;

            let mut submitted_key = data.user_id.as_bytes().to_vec();
            submitted_key.push(KEY_SEPARATOR);
            submitted_key.extend_from_slice(data.tx_id.as_bytes());
            batch.put_cf(&self.cf(ProvenanceColumn::TxSubmittedByUser), submitted_key, []);

            let locator = borsh::to_vec(&(block_num, data.tx_index))
                .expect("borsh serialization should not fail");
            batch.put_cf(&self.cf(ProvenanceColumn::TxLocator), data.tx_id.as_bytes(), locator);

            if !data.is_valid {
                continue;
            }

            for kv in &data.writes {
                let version = kv.metadata.version;
                let prev = data.old_version_of_writes.get(&kv.key).copied();
                let record = VersionChainRecord {
                    value: kv.value.clone(),
                    version,
                    prev,
                    next: None,
                };
                batch.put_cf(
                    &self.cf(ProvenanceColumn::Values),
                    chain_key(&data.db_name, &kv.key, version),
                    borsh::to_vec(&record).expect("borsh serialization should not fail"),
                );
                if let Some(prev_version) = prev {
                    self.link_next(&mut batch, &data.db_name, &kv.key, prev_version, version)?;
                }
                batch.put_cf(
                    &self.cf(ProvenanceColumn::WritesByUser),
                    user_triple_key(&data.user_id, &data.db_name, &kv.key, version),
                    [],
                );
                *writer_bumps
                    .entry(access_count_key(&data.db_name, &kv.key, &data.user_id))
                    .or_default() += 1;
            }

            for read in &data.reads {
                batch.put_cf(
                    &self.cf(ProvenanceColumn::ReadsByUser),
                    user_triple_key(&data.user_id, &data.db_name, &read.key, read.version),
                    [],
                );
                *reader_bumps
                    .entry(access_count_key(&data.db_name, &read.key, &data.user_id))
                    .or_default() += 1;
            }

            for delete in &data.deletes {
                batch.put_cf(
                    &self.cf(ProvenanceColumn::DeletesByUser),
                    user_triple_key(&data.user_id, &data.db_name, &delete.key, delete.version),
                    [],
                );
            }
        }

        self.apply_access_bumps(&mut batch, ProvenanceColumn::KeyReaders, reader_bumps)?;
        self.apply_access_bumps(&mut batch, ProvenanceColumn::KeyWriters, writer_bumps)?;
        if block_num > self.height()? {
            batch.put_cf(&self.cf(ProvenanceColumn::Misc), HEIGHT_KEY, block_num.to_le_bytes());
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        debug!(target: "provenance", block_num, txs = tx_data.len(), "committed provenance data");
        Ok(())
    }

    fn check_duplicate_tx_id(
        &self,
        data: &TxDataForProvenance,
        block_num: BlockNum,
    ) -> Result<(), ProvenanceError> {
        if let Some((existing_block, existing_index)) = self.get_tx_locator(&data.tx_id)? {
            if existing_block != block_num || existing_index != data.tx_index {
                return Err(ProvenanceError::DuplicateTxId {
                    tx_id: data.tx_id.clone(),
                    block_num: existing_block,
                    tx_index: existing_index,
                });
            }
        }
        Ok(())
    }

    fn link_next(
        &self,
        batch: &mut WriteBatch,
        db_name: &str,
        key: &str,
        prev_version: Version,
        next_version: Version,
    ) -> Result<(), ProvenanceError> {
        let prev_key = chain_key(db_name, key, prev_version);
        let Some(bytes) = self.db.get_cf(&self.cf(ProvenanceColumn::Values), &prev_key)? else {
            // The previous version predates provenance tracking (e.g. written
            // before a catch-up snapshot); nothing to link.
            return Ok(());
        };
        let mut record: VersionChainRecord = decode(&bytes)?;
        record.next = Some(next_version);
        batch.put_cf(
            &self.cf(ProvenanceColumn::Values),
            prev_key,
            borsh::to_vec(&record).expect("borsh serialization should not fail"),
        );
        Ok(())
    }

    fn apply_access_bumps(
        &self,
        batch: &mut WriteBatch,
        column: ProvenanceColumn,
        bumps: BTreeMap<Vec<u8>, u64>,
    ) -> Result<(), ProvenanceError> {
        for (count_key, bump) in bumps {
            let current = match self.db.get_cf(&self.cf(column), &count_key)? {
                Some(bytes) => u64::from_le_bytes(bytes.as_slice().try_into().map_err(|_| {
                    ProvenanceError::Corruption(format!("access counter of {} bytes", bytes.len()))
                })?),
                None => 0,
            };
            batch.put_cf(&self.cf(column), count_key, (current + bump).to_le_bytes());
        }
        Ok(())
    }

    /// The full committed history of a key, oldest first.
    pub fn get_values(
        &self,
        db_name: &str,
        key: &str,
    ) -> Result<Vec<(Vec<u8>, Version)>, ProvenanceError> {
        let prefix = chain_prefix(db_name, key);
        let mut values = vec![];
        for item in self.iter_prefix(ProvenanceColumn::Values, &prefix) {
            let (_, bytes) = item?;
            let record: VersionChainRecord = decode(&bytes)?;
            values.push((record.value, record.version));
        }
        Ok(values)
    }

    pub fn get_value_at(
        &self,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<Option<(Vec<u8>, Version)>, ProvenanceError> {
        Ok(self.chain_record(db_name, key, version)?.map(|record| (record.value, record.version)))
    }

    /// The most recent committed value of the key at or below `version`.
    pub fn get_most_recent_at_or_below(
        &self,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<Option<(Vec<u8>, Version)>, ProvenanceError> {
        let prefix = chain_prefix(db_name, key);
        let seek_key = chain_key(db_name, key, version);
        let iter = self.db.iterator_cf(
            &self.cf(ProvenanceColumn::Values),
            IteratorMode::From(&seek_key, Direction::Reverse),
        );
        for item in iter {
            let (found_key, bytes) = item?;
            if !found_key.starts_with(&prefix) {
                return Ok(None);
            }
            let record: VersionChainRecord = decode(&bytes)?;
            if record.version <= version {
                return Ok(Some((record.value, record.version)));
            }
        }
        Ok(None)
    }

    /// Values committed before `version` for the key, newest first, by
    /// walking the chain's `prev` links.
    pub fn get_previous_values(
        &self,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<Vec<(Vec<u8>, Version)>, ProvenanceError> {
        let mut values = vec![];
        let mut current = self.chain_record(db_name, key, version)?.and_then(|record| record.prev);
        while let Some(prev_version) = current {
            let Some(record) = self.chain_record(db_name, key, prev_version)? else { break };
            current = record.prev;
            values.push((record.value, record.version));
        }
        Ok(values)
    }

    /// Values committed after `version` for the key, oldest first, by walking
    /// the chain's `next` links.
    pub fn get_next_values(
        &self,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<Vec<(Vec<u8>, Version)>, ProvenanceError> {
        let mut values = vec![];
        let mut current = self.chain_record(db_name, key, version)?.and_then(|record| record.next);
        while let Some(next_version) = current {
            let Some(record) = self.chain_record(db_name, key, next_version)? else { break };
            current = record.next;
            values.push((record.value, record.version));
        }
        Ok(values)
    }

    pub fn get_values_read_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<(String, String, Option<Vec<u8>>, Version)>, ProvenanceError> {
        self.user_access_entries(ProvenanceColumn::ReadsByUser, user_id)
    }

    pub fn get_values_written_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<(String, String, Option<Vec<u8>>, Version)>, ProvenanceError> {
        self.user_access_entries(ProvenanceColumn::WritesByUser, user_id)
    }

    pub fn get_values_deleted_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<(String, String, Option<Vec<u8>>, Version)>, ProvenanceError> {
        self.user_access_entries(ProvenanceColumn::DeletesByUser, user_id)
    }

    /// `(db, key, value at recorded version, version)` triples of one user
    /// index. A read of a key that never existed has no resolvable value.
    fn user_access_entries(
        &self,
        column: ProvenanceColumn,
        user_id: &str,
    ) -> Result<Vec<(String, String, Option<Vec<u8>>, Version)>, ProvenanceError> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);
        let mut entries = vec![];
        for item in self.iter_prefix(column, &prefix) {
            let (found_key, _) = item?;
            let (db_name, key, version) = decode_user_triple(&found_key[prefix.len()..])?;
            let value = self
                .chain_record(&db_name, &key, version)?
                .map(|record| record.value);
            entries.push((db_name, key, value, version));
        }
        Ok(entries)
    }

    /// Users that read the key, with access counts.
    pub fn get_readers(
        &self,
        db_name: &str,
        key: &str,
    ) -> Result<BTreeMap<String, u64>, ProvenanceError> {
        self.access_counts(ProvenanceColumn::KeyReaders, db_name, key)
    }

    /// Users that wrote the key, with access counts.
    pub fn get_writers(
        &self,
        db_name: &str,
        key: &str,
    ) -> Result<BTreeMap<String, u64>, ProvenanceError> {
        self.access_counts(ProvenanceColumn::KeyWriters, db_name, key)
    }

    fn access_counts(
        &self,
        column: ProvenanceColumn,
        db_name: &str,
        key: &str,
    ) -> Result<BTreeMap<String, u64>, ProvenanceError> {
        let prefix = chain_prefix(db_name, key);
        let mut counts = BTreeMap::new();
        for item in self.iter_prefix(column, &prefix) {
            let (found_key, bytes) = item?;
            let user = String::from_utf8_lossy(&found_key[prefix.len()..]).into_owned();
            let count = u64::from_le_bytes(bytes.as_ref().try_into().map_err(|_| {
                ProvenanceError::Corruption(format!("access counter of {} bytes", bytes.len()))
            })?);
            counts.insert(user, count);
        }
        Ok(counts)
    }

    pub fn get_tx_ids_submitted_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<String>, ProvenanceError> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);
        let mut tx_ids = vec![];
        for item in self.iter_prefix(ProvenanceColumn::TxSubmittedByUser, &prefix) {
            let (found_key, _) = item?;
            tx_ids.push(String::from_utf8_lossy(&found_key[prefix.len()..]).into_owned());
        }
        Ok(tx_ids)
    }

    /// Last committed block number, 0 when nothing was committed yet.
    pub fn height(&self) -> Result<BlockNum, ProvenanceError> {
        match self.db.get_cf(&self.cf(ProvenanceColumn::Misc), HEIGHT_KEY)? {
            Some(bytes) => Ok(u64::from_le_bytes(bytes.as_slice().try_into().map_err(
                |_| ProvenanceError::Corruption(format!("height record of {} bytes", bytes.len())),
            )?)),
            None => Ok(0),
        }
    }

    pub fn get_tx_locator(
        &self,
        tx_id: &str,
    ) -> Result<Option<(BlockNum, u64)>, ProvenanceError> {
        match self.db.get_cf(&self.cf(ProvenanceColumn::TxLocator), tx_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn chain_record(
        &self,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<Option<VersionChainRecord>, ProvenanceError> {
        match self
            .db
            .get_cf(&self.cf(ProvenanceColumn::Values), chain_key(db_name, key, version))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn iter_prefix<'a>(
        &'a self,
        column: ProvenanceColumn,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + 'a {
        let mut read_opts = ReadOptions::default();
        if let Some(upper) = prefix_upper_bound(prefix) {
            read_opts.set_iterate_upper_bound(upper);
        }
        self.db.iterator_cf_opt(
            &self.cf(column),
            read_opts,
            IteratorMode::From(prefix, Direction::Forward),
        )
    }
}

fn decode<T: borsh::BorshDeserialize>(bytes: &[u8]) -> Result<T, ProvenanceError> {
    borsh::from_slice(bytes).map_err(|err| ProvenanceError::Corruption(err.to_string()))
}

fn version_suffix(version: Version) -> [u8; VERSION_SUFFIX_LEN] {
    let mut suffix = [0u8; VERSION_SUFFIX_LEN];
    suffix[..8].copy_from_slice(&version.block_num.to_be_bytes());
    suffix[8..].copy_from_slice(&version.tx_num.to_be_bytes());
    suffix
}

fn chain_prefix(db_name: &str, key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(db_name.len() + key.len() + 2);
    prefix.extend_from_slice(db_name.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn chain_key(db_name: &str, key: &str, version: Version) -> Vec<u8> {
    let mut chain_key = chain_prefix(db_name, key);
    chain_key.extend_from_slice(&version_suffix(version));
    chain_key
}

fn user_triple_key(user_id: &str, db_name: &str, key: &str, version: Version) -> Vec<u8> {
    let mut triple = Vec::with_capacity(user_id.len() + db_name.len() + key.len() + 18);
    triple.extend_from_slice(user_id.as_bytes());
    triple.push(KEY_SEPARATOR);
    triple.extend_from_slice(db_name.as_bytes());
    triple.push(KEY_SEPARATOR);
    triple.extend_from_slice(key.as_bytes());
    triple.push(KEY_SEPARATOR);
    triple.extend_from_slice(&version_suffix(version));
    triple
}

/// Splits `db \0 key \0 version` back into its parts.
fn decode_user_triple(bytes: &[u8]) -> Result<(String, String, Version), ProvenanceError> {
    let malformed = || ProvenanceError::Corruption("malformed user index key".to_string());
    if bytes.len() < VERSION_SUFFIX_LEN + 2 {
        return Err(malformed());
    }
    let (head, suffix) = bytes.split_at(bytes.len() - VERSION_SUFFIX_LEN);
    let head = head.strip_suffix(&[KEY_SEPARATOR]).ok_or_else(malformed)?;
    let separator = head.iter().position(|b| *b == KEY_SEPARATOR).ok_or_else(malformed)?;
    let version = Version::new(
        u64::from_be_bytes(suffix[..8].try_into().expect("fixed slice")),
        u64::from_be_bytes(suffix[8..].try_into().expect("fixed slice")),
    );
    Ok((
        String::from_utf8_lossy(&head[..separator]).into_owned(),
        String::from_utf8_lossy(&head[separator + 1..]).into_owned(),
        version,
    ))
}

fn access_count_key(db_name: &str, key: &str, user_id: &str) -> Vec<u8> {
    let mut count_key = chain_prefix(db_name, key);
    count_key.extend_from_slice(user_id.as_bytes());
    count_key
}

/// Smallest byte string greater than every string with the given prefix, or
/// None when the prefix is all 0xFF.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last() {
        if *last == u8::MAX {
            upper.pop();
        } else {
            *upper.last_mut().expect("non-empty") += 1;
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ledger_primitives::types::Metadata;

    fn open(dir: &std::path::Path) -> ProvenanceStore {
        ProvenanceStore::open(dir.join("provenance")).unwrap()
    }

    fn write(key: &str, value: &[u8], version: Version) -> KvWithMetadata {
        KvWithMetadata {
            key: key.to_string(),
            value: value.to_vec(),
            metadata: Metadata { version, access_control: None },
        }
    }

    fn tx_data(
        user_id: &str,
        tx_id: &str,
        tx_index: u64,
        writes: Vec<KvWithMetadata>,
        old_versions: BTreeMap<String, Version>,
    ) -> TxDataForProvenance {
        TxDataForProvenance {
            db_name: "db1".to_string(),
            user_id: user_id.to_string(),
            tx_id: tx_id.to_string(),
            tx_index,
            reads: vec![],
            writes,
            deletes: vec![],
            old_version_of_writes: old_versions,
            is_valid: true,
        }
    }

    #[test]
    fn version_chain_walks_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store
            .commit(2, &[tx_data("alice", "tx1", 0, vec![write("k1", b"v1", Version::new(2, 0))], BTreeMap::new())])
            .unwrap();
        store
            .commit(
                3,
                &[tx_data(
                    "bob",
                    "tx2",
                    0,
                    vec![write("k1", b"v2", Version::new(3, 0))],
                    BTreeMap::from([("k1".to_string(), Version::new(2, 0))]),
                )],
            )
            .unwrap();
        store
            .commit(
                4,
                &[tx_data(
                    "alice",
                    "tx3",
                    0,
                    vec![write("k1", b"v3", Version::new(4, 0))],
                    BTreeMap::from([("k1".to_string(), Version::new(3, 0))]),
                )],
            )
            .unwrap();

        let values = store.get_values("db1", "k1").unwrap();
        assert_eq!(
            values,
            vec![
                (b"v1".to_vec(), Version::new(2, 0)),
                (b"v2".to_vec(), Version::new(3, 0)),
                (b"v3".to_vec(), Version::new(4, 0)),
            ]
        );

        assert_eq!(
            store.get_value_at("db1", "k1", Version::new(3, 0)).unwrap(),
            Some((b"v2".to_vec(), Version::new(3, 0)))
        );
        assert_eq!(store.get_value_at("db1", "k1", Version::new(3, 1)).unwrap(), None);

        assert_eq!(
            store.get_previous_values("db1", "k1", Version::new(4, 0)).unwrap(),
            vec![(b"v2".to_vec(), Version::new(3, 0)), (b"v1".to_vec(), Version::new(2, 0))]
        );
        assert_eq!(
            store.get_next_values("db1", "k1", Version::new(2, 0)).unwrap(),
            vec![(b"v2".to_vec(), Version::new(3, 0)), (b"v3".to_vec(), Version::new(4, 0))]
        );

        assert_eq!(
            store.get_most_recent_at_or_below("db1", "k1", Version::new(3, 5)).unwrap(),
            Some((b"v2".to_vec(), Version::new(3, 0)))
        );
        assert_eq!(
            store.get_most_recent_at_or_below("db1", "k1", Version::new(1, 0)).unwrap(),
            None
        );
    }

    #[test]
    fn user_indexes_and_access_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        let mut data =
            tx_data("alice", "tx1", 0, vec![write("k1", b"v1", Version::new(2, 0))], BTreeMap::new());
        data.reads = vec![KeyWithVersion { key: "k0".to_string(), version: Version::default() }];
        store.commit(2, &[data]).unwrap();

        let mut second =
            tx_data("alice", "tx2", 0, vec![write("k1", b"v2", Version::new(3, 0))], BTreeMap::from([("k1".to_string(), Version::new(2, 0))]));
        second.reads =
            vec![KeyWithVersion { key: "k1".to_string(), version: Version::new(2, 0) }];
        store.commit(3, &[second]).unwrap();

        let written = store.get_values_written_by_user("alice").unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].0, "db1");
        assert_eq!(written[0].1, "k1");
        assert_eq!(written[0].2, Some(b"v1".to_vec()));

        let read = store.get_values_read_by_user("alice").unwrap();
        assert_eq!(read.len(), 2);
        // The read of the never-written key has no resolvable value.
        assert_eq!(read[0].1, "k0");
        assert_eq!(read[0].2, None);
        assert_eq!(read[1].2, Some(b"v1".to_vec()));

        assert_eq!(store.get_writers("db1", "k1").unwrap(), BTreeMap::from([("alice".to_string(), 2)]));
        assert_eq!(store.get_readers("db1", "k1").unwrap(), BTreeMap::from([("alice".to_string(), 1)]));

        assert_eq!(
            store.get_tx_ids_submitted_by_user("alice").unwrap(),
            vec!["tx1".to_string(), "tx2".to_string()]
        );
        assert_eq!(store.get_tx_locator("tx2").unwrap(), Some((3, 0)));
        assert_eq!(store.get_tx_locator("unknown").unwrap(), None);
    }

    #[test]
    fn invalid_tx_records_only_links() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut data =
            tx_data("alice", "tx1", 3, vec![write("k1", b"v1", Version::new(2, 3))], BTreeMap::new());
        data.is_valid = false;
        store.commit(2, &[data]).unwrap();

        assert!(store.get_values("db1", "k1").unwrap().is_empty());
        assert!(store.get_values_written_by_user("alice").unwrap().is_empty());
        assert_eq!(store.get_tx_locator("tx1").unwrap(), Some((2, 3)));
        assert_eq!(store.get_tx_ids_submitted_by_user("alice").unwrap(), vec!["tx1".to_string()]);
    }

    #[test]
    fn duplicate_tx_id_is_rejected_but_replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let data =
            tx_data("alice", "tx1", 0, vec![write("k1", b"v1", Version::new(2, 0))], BTreeMap::new());
        store.commit(2, &[data.clone()]).unwrap();

        // Replaying the same block is fine.
        store.commit(2, &[data.clone()]).unwrap();
        assert_eq!(store.get_values("db1", "k1").unwrap().len(), 1);

        // The same tx id at a different position is not.
        let mut moved = data;
        moved.tx_index = 1;
        assert_matches!(
            store.commit(5, &[moved]),
            Err(ProvenanceError::DuplicateTxId { block_num: 2, tx_index: 0, .. })
        );
    }

    #[test]
    fn deletes_are_attributed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store
            .commit(2, &[tx_data("alice", "tx1", 0, vec![write("k1", b"v1", Version::new(2, 0))], BTreeMap::new())])
            .unwrap();

        let mut deletion = tx_data("bob", "tx2", 0, vec![], BTreeMap::new());
        deletion.deletes =
            vec![KeyWithVersion { key: "k1".to_string(), version: Version::new(2, 0) }];
        store.commit(3, &[deletion]).unwrap();

        let deleted = store.get_values_deleted_by_user("bob").unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].1, "k1");
        // The deleted value resolves to what was last committed.
        assert_eq!(deleted[0].2, Some(b"v1".to_vec()));
        assert_eq!(deleted[0].3, Version::new(2, 0));
    }
}
