use ledger_primitives::cluster::ClusterConfig;
use ledger_primitives::types::{
    is_system_db, system_dbs, valid_db_name, BlockNum, KvWithMetadata, Metadata, ValueWithMetadata,
    CONFIG_DB, CONFIG_KEY, DATABASES_DB, DEFAULT_DB, METADATA_DB,
};
use rocksdb::{
    ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    ReadOptions, WriteBatch, WriteOptions,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

mod cache;

use cache::StateCache;

type Db = DBWithThreadMode<MultiThreaded>;

/// Marker file present while the store directory is being populated for the
/// first time. Finding it on open means a previous creation attempt died
/// half-way; the directory is wiped and recreated.
const UNDER_CREATION_MARKER: &str = "undercreation";
/// Subdirectory holding the rocksdb instance, kept apart from the marker.
const DATA_DIR: &str = "data";
/// Column family rocksdb creates implicitly. Not a ledger database.
const ROCKSDB_DEFAULT_CF: &str = "default";

const LAST_COMMITTED_BLOCK_NUM_KEY: &[u8] = b"lastCommittedBlockNumber";

const DEFAULT_CACHE_SIZE_BYTES: usize = 128 << 20;

#[derive(Debug, thiserror::Error)]
pub enum WorldStateError {
    #[error("database {db_name} does not exist")]
    DbNotFound { db_name: String },
    #[error("invalid database name [{db_name}]")]
    InvalidDbName { db_name: String },
    #[error("worldstate storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("worldstate io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupted record in database {db_name}, key [{key}]: {reason}")]
    Corruption { db_name: String, key: String, reason: String },
}

/// Writes and deletes of one database within a block commit.
#[derive(Debug, Clone, Default)]
pub struct DbUpdates {
    pub writes: Vec<KvWithMetadata>,
    pub deletes: Vec<String>,
}

pub struct StateStoreConfig {
    pub root_dir: PathBuf,
    pub cache_size_bytes: usize,
}

impl StateStoreConfig {
    pub fn new(root_dir: PathBuf) -> Self {
        StateStoreConfig { root_dir, cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES }
    }
}

/// Versioned key-value state of the ledger. One rocksdb column family per
/// database; system databases are pre-created on first open. The committer is
/// the only writer and each block commit is a single atomic write batch, so
/// readers always observe the state as of some committed block.
pub struct StateStore {
    root_dir: PathBuf,
    db: Db,
    cache: StateCache,
}

impl StateStore {
    pub fn open(config: StateStoreConfig) -> Result<Self, WorldStateError> {
        let root_dir = config.root_dir;
        let marker = root_dir.join(UNDER_CREATION_MARKER);
        let data_dir = root_dir.join(DATA_DIR);

        if root_dir.exists() {
            let partially_created = marker.exists() || !data_dir.exists();
            if partially_created {
                warn!(target: "worldstate", dir = %root_dir.display(),
                      "removing partially created state store");
                std::fs::remove_dir_all(&root_dir)?;
                return Self::open_new(root_dir, config.cache_size_bytes);
            }
            return Self::open_existing(root_dir, config.cache_size_bytes);
        }
        Self::open_new(root_dir, config.cache_size_bytes)
    }

    fn open_new(root_dir: PathBuf, cache_size: usize) -> Result<Self, WorldStateError> {
        std::fs::create_dir_all(&root_dir)?;
        let marker = root_dir.join(UNDER_CREATION_MARKER);
        std::fs::write(&marker, [])?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let mut descriptors: Vec<ColumnFamilyDescriptor> = vec![];
        for db_name in system_dbs() {
            descriptors.push(ColumnFamilyDescriptor::new(db_name, Options::default()));
        }
        descriptors.push(ColumnFamilyDescriptor::new(DEFAULT_DB, Options::default()));
        let db = Db::open_cf_descriptors(&opts, root_dir.join(DATA_DIR), descriptors)?;

        std::fs::remove_file(&marker)?;
        info!(target: "worldstate", dir = %root_dir.display(), "created new state store");
        Ok(StateStore { root_dir, db, cache: StateCache::new(cache_size) })
    }

    fn open_existing(root_dir: PathBuf, cache_size: usize) -> Result<Self, WorldStateError> {
        let data_dir = root_dir.join(DATA_DIR);
        let cf_names = Db::list_cf(&Options::default(), &data_dir)?;
        let descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();
        let mut opts = Options::default();
        opts.create_if_missing(false);
        let db = Db::open_cf_descriptors(&opts, data_dir, descriptors)?;
        debug!(target: "worldstate", dir = %root_dir.display(), "opened existing state store");
        Ok(StateStore { root_dir, db, cache: StateCache::new(cache_size) })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn cf(
        &self,
        db_name: &str,
    ) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, WorldStateError> {
        if db_name == ROCKSDB_DEFAULT_CF {
            return Err(WorldStateError::DbNotFound { db_name: db_name.to_string() });
        }
        self.db
            .cf_handle(db_name)
            .ok_or_else(|| WorldStateError::DbNotFound { db_name: db_name.to_string() })
    }

    /// Returns true if the given database exists.
    pub fn exists(&self, db_name: &str) -> bool {
        db_name != ROCKSDB_DEFAULT_CF && self.db.cf_handle(db_name).is_some()
    }

    /// Returns the value and metadata of `key`, or None if absent. Reads go
    /// through the cache, recording negative results as well.
    pub fn get(
        &self,
        db_name: &str,
        key: &str,
    ) -> Result<Option<ValueWithMetadata>, WorldStateError> {
        let cf = self.cf(db_name)?;
        if let Some(cached) = self.cache.get(db_name, key) {
            return match cached {
                Some(bytes) => Ok(Some(decode_value(db_name, key, &bytes)?)),
                None => Ok(None),
            };
        }
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => {
                let value = decode_value(db_name, key, &bytes)?;
                self.cache.put(db_name, key, Some(bytes));
                Ok(Some(value))
            }
            None => {
                self.cache.put(db_name, key, None);
                Ok(None)
            }
        }
    }

    pub fn get_version(
        &self,
        db_name: &str,
        key: &str,
    ) -> Result<Option<ledger_primitives::types::Version>, WorldStateError> {
        Ok(self.get(db_name, key)?.map(|value| value.metadata.version))
    }

    pub fn get_acl(
        &self,
        db_name: &str,
        key: &str,
    ) -> Result<Option<ledger_primitives::types::AccessControl>, WorldStateError> {
        Ok(self.get(db_name, key)?.and_then(|value| value.metadata.access_control))
    }

    /// Existence check that bypasses the cache. A missing database yields
    /// `Ok(false)` rather than an error.
    pub fn has(&self, db_name: &str, key: &str) -> Result<bool, WorldStateError> {
        let Ok(cf) = self.cf(db_name) else {
            return Ok(false);
        };
        Ok(self.db.get_pinned_cf(&cf, key.as_bytes())?.is_some())
    }

    /// Iterates `[start, end)` in lexicographic key order. Empty bounds are
    /// open: an empty `start` begins at the first key, an empty `end` runs to
    /// the last. The iterator observes a consistent point-in-time view.
    pub fn range_iterator<'a>(
        &'a self,
        db_name: &str,
        start: &str,
        end: &str,
    ) -> Result<impl Iterator<Item = Result<(String, ValueWithMetadata), WorldStateError>> + 'a, WorldStateError>
    {
        let cf = self.cf(db_name)?;
        let mut read_opts = ReadOptions::default();
        if !end.is_empty() {
            read_opts.set_iterate_upper_bound(end.as_bytes().to_vec());
        }
        let mode = if start.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(start.as_bytes(), Direction::Forward)
        };
        let db_name = db_name.to_string();
        Ok(self.db.iterator_cf_opt(&cf, read_opts, mode).map(move |item| {
            let (key, bytes) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let value = decode_value(&db_name, &key, &bytes)?;
            Ok((key, value))
        }))
    }

    /// Atomically applies a block's worth of updates and advances the store
    /// height to `block_num`. Writes to [`DATABASES_DB`] additionally create
    /// or drop the named databases once the batch is durable; both operations
    /// are no-ops when the database already exists or is already gone, which
    /// makes recovery replay safe.
    pub fn commit(
        &self,
        updates: &BTreeMap<String, DbUpdates>,
        block_num: BlockNum,
    ) -> Result<(), WorldStateError> {
        let mut batch = WriteBatch::default();
        for (db_name, db_updates) in updates {
            let cf = self.cf(db_name)?;
            for kv in &db_updates.writes {
                let record = ValueWithMetadata {
                    value: kv.value.clone(),
                    metadata: kv.metadata.clone(),
                };
                let bytes =
                    borsh::to_vec(&record).expect("borsh serialization should not fail");
                batch.put_cf(&cf, kv.key.as_bytes(), bytes);
            }
            for key in &db_updates.deletes {
                batch.delete_cf(&cf, key.as_bytes());
            }
        }
        if block_num > self.height()? {
            let meta_cf = self.cf(METADATA_DB)?;
            batch.put_cf(&meta_cf, LAST_COMMITTED_BLOCK_NUM_KEY, block_num.to_le_bytes());
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;

        for (db_name, db_updates) in updates {
            for kv in &db_updates.writes {
                let record = ValueWithMetadata {
                    value: kv.value.clone(),
                    metadata: kv.metadata.clone(),
                };
                let bytes =
                    borsh::to_vec(&record).expect("borsh serialization should not fail");
                self.cache.put_if_exist(db_name, &kv.key, bytes);
            }
            for key in &db_updates.deletes {
                self.cache.purge(db_name, key);
            }
        }

        if let Some(catalogue) = updates.get(DATABASES_DB) {
            for kv in &catalogue.writes {
                self.create_db(&kv.key)?;
            }
            for db_name in &catalogue.deletes {
                self.delete_db(db_name)?;
            }
        }
        debug!(target: "worldstate", block_num, "committed state updates");
        Ok(())
    }

    /// Last committed block number, 0 when nothing was committed yet.
    pub fn height(&self) -> Result<BlockNum, WorldStateError> {
        let cf = self.cf(METADATA_DB)?;
        match self.db.get_cf(&cf, LAST_COMMITTED_BLOCK_NUM_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    WorldStateError::Corruption {
                        db_name: METADATA_DB.to_string(),
                        key: String::from_utf8_lossy(LAST_COMMITTED_BLOCK_NUM_KEY).into_owned(),
                        reason: format!("height record of {} bytes", bytes.len()),
                    }
                })?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Names of user-created databases, i.e. the catalogue contents.
    pub fn list_user_dbs(&self) -> Result<Vec<String>, WorldStateError> {
        let cf = self.cf(DATABASES_DB)?;
        let mut names = vec![];
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    /// The committed cluster configuration, absent only before genesis.
    pub fn get_config(&self) -> Result<Option<(ClusterConfig, Metadata)>, WorldStateError> {
        let Some(record) = self.get(CONFIG_DB, CONFIG_KEY)? else {
            return Ok(None);
        };
        let config = borsh::from_slice::<ClusterConfig>(&record.value).map_err(|err| {
            WorldStateError::Corruption {
                db_name: CONFIG_DB.to_string(),
                key: CONFIG_KEY.to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(Some((config, record.metadata)))
    }

    /// Index definition bytes recorded when the database was created.
    pub fn get_index_definition(
        &self,
        db_name: &str,
    ) -> Result<Option<ValueWithMetadata>, WorldStateError> {
        self.get(DATABASES_DB, db_name)
    }

    fn create_db(&self, db_name: &str) -> Result<(), WorldStateError> {
        if !valid_db_name(db_name) {
            return Err(WorldStateError::InvalidDbName { db_name: db_name.to_string() });
        }
        if self.exists(db_name) {
            debug!(target: "worldstate", db_name, "skipping create, database already exists");
            return Ok(());
        }
        self.db.create_cf(db_name, &Options::default())?;
        Ok(())
    }

    fn delete_db(&self, db_name: &str) -> Result<(), WorldStateError> {
        if is_system_db(db_name) || db_name == DEFAULT_DB {
            return Err(WorldStateError::InvalidDbName { db_name: db_name.to_string() });
        }
        if !self.exists(db_name) {
            return Ok(());
        }
        self.db.drop_cf(db_name)?;
        self.cache.purge_db(db_name);
        Ok(())
    }
}

fn decode_value(
    db_name: &str,
    key: &str,
    bytes: &[u8],
) -> Result<ValueWithMetadata, WorldStateError> {
    borsh::from_slice(bytes).map_err(|err| WorldStateError::Corruption {
        db_name: db_name.to_string(),
        key: key.to_string(),
        reason: err.to_string(),
    })
}
