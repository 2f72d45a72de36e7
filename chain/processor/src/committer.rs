use crate::errors::TxError;
use crate::pending::PendingTxs;
use crate::validator::{SignatureVerifier, Validator, ValidatorError};
use crossbeam_channel::Receiver;
use ledger_primitives::block::{Block, BlockPayload};
use ledger_primitives::cluster::ClusterConfig;
use ledger_primitives::merkle::{build_tree_for_block_tx, MerkleError};
use ledger_primitives::transaction::canonical_bytes;
use ledger_primitives::types::{
    user_key, BlockNum, KvWithMetadata, Metadata, Privilege, User, Version, CONFIG_DB,
    CONFIG_KEY, DATABASES_DB, USERS_DB,
};
use ledger_primitives::validation::ValidationInfo;
use ledger_store::blockstore::{BlockStore, BlockStoreError};
use ledger_store::provenance::{ProvenanceError, ProvenanceStore, TxDataForProvenance};
use ledger_store::worldstate::{DbUpdates, StateStore, WorldStateError};
use ledger_store::KeyWithVersion;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub(crate) enum CommitterError {
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
    #[error(transparent)]
    State(#[from] WorldStateError),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

/// Lets the block creator wait for its proposal to finish committing before
/// linking the next block.
pub(crate) struct CommitWatch {
    height: Mutex<BlockNum>,
    condvar: Condvar,
}

impl CommitWatch {
    pub(crate) fn new(height: BlockNum) -> Self {
        CommitWatch { height: Mutex::new(height), condvar: Condvar::new() }
    }

    pub(crate) fn height(&self) -> BlockNum {
        *self.height.lock()
    }

    pub(crate) fn notify(&self, height: BlockNum) {
        let mut current = self.height.lock();
        if height > *current {
            *current = height;
            self.condvar.notify_all();
        }
    }

    /// True once the committed height reaches `target`, false on timeout.
    pub(crate) fn wait_at_least(&self, target: BlockNum, timeout: Duration) -> bool {
        let mut current = self.height.lock();
        if *current >= target {
            return true;
        }
        self.condvar.wait_while_for(&mut current, |height| *height < target, timeout);
        *current >= target
    }
}

/// Where the committed version of a key (and of the cluster config) is read
/// from while translating a block into store updates. The live commit path
/// reads the state store; crash recovery replays against the provenance
/// chains because the state store has already advanced.
pub trait CommittedVersions {
    type Error;
    fn version_of(&self, db_name: &str, key: &str) -> Result<Option<Version>, Self::Error>;
    fn committed_config(&self) -> Result<Option<(ClusterConfig, Version)>, Self::Error>;
}

/// [`CommittedVersions`] over the live state store.
pub struct StateVersions<'a> {
    pub state: &'a StateStore,
}

impl CommittedVersions for StateVersions<'_> {
    type Error = WorldStateError;

    fn version_of(&self, db_name: &str, key: &str) -> Result<Option<Version>, Self::Error> {
        self.state.get_version(db_name, key)
    }

    fn committed_config(&self) -> Result<Option<(ClusterConfig, Version)>, Self::Error> {
        Ok(self.state.get_config()?.map(|(config, metadata)| (config, metadata.version)))
    }
}

/// Single-threaded commit loop: applies blocks delivered by consensus, in
/// order, across the three stores. The block store append is the write-ahead
/// point; state and provenance follow and are rolled forward from the block
/// store after a crash.
pub(crate) struct Committer {
    pub(crate) state: Arc<StateStore>,
    pub(crate) block_store: Arc<BlockStore>,
    pub(crate) provenance: Arc<ProvenanceStore>,
    pub(crate) validator: Arc<Validator>,
    pub(crate) sig_verifier: Arc<SignatureVerifier>,
    pub(crate) pending: Arc<PendingTxs>,
    pub(crate) commit_watch: Arc<CommitWatch>,
    pub(crate) halted: Arc<AtomicBool>,
}

impl Committer {
    pub(crate) fn run(&self, committed_blocks: Receiver<Block>) {
        while let Ok(block) = committed_blocks.recv() {
            let number = block.number();
            if let Err(err) = self.commit_block(block) {
                // Storage failures are fatal: stop applying, fail every
                // pending promise and reject further submissions.
                error!(target: "processor", number, %err, "block commit failed, halting");
                self.halted.store(true, Ordering::SeqCst);
                self.pending.drain(&TxError::Storage(err.to_string()));
                return;
            }
        }
    }

    pub(crate) fn commit_block(&self, mut block: Block) -> Result<(), CommitterError> {
        let number = block.number();
        if number <= self.block_store.height() {
            // Redelivered during catch-up or recovery; effects are already
            // durable.
            debug!(target: "processor", number, "skipping already committed block");
            self.commit_watch.notify(number);
            return Ok(());
        }

        let validation_info = self.validator.validate_block(&block)?;
        block.header.validation_info = validation_info.clone();
        block.header.tx_merkle_root = build_tree_for_block_tx(&block)?;
        self.block_store.add_skip_list_links(&mut block)?;

        // Old versions must be read before the state advances.
        let (updates, provenance_data) =
            block_updates(&block, &validation_info, &StateVersions { state: &self.state })?;

        self.block_store.append(&block)?;
        self.state.commit(&updates, number)?;
        self.provenance.commit(number, &provenance_data)?;

        let tx_ids = block.tx_ids();
        let errors: Vec<Option<TxError>> = validation_info
            .iter()
            .map(|info| {
                (!info.is_valid())
                    .then(|| TxError::Invalid { flag: info.flag, reason: info.reason.clone() })
            })
            .collect();
        self.pending.done_with_receipt(&tx_ids, &block.header, &errors);

        // Committed user or config changes can alter registered keys.
        if validation_info.first().is_some_and(ValidationInfo::is_valid)
            && matches!(
                block.payload,
                BlockPayload::UserAdminTx(_) | BlockPayload::ConfigTx(_)
            )
        {
            self.sig_verifier.invalidate();
        }

        self.commit_watch.notify(number);
        info!(target: "processor", number, txs = tx_ids.len(), "committed block");
        Ok(())
    }
}

/// Translates a validated block into state-store updates and provenance
/// records. Only valid transactions mutate state; invalid ones still get
/// their submitter and locator links recorded. Versions are assigned as
/// `(block number, tx number)`.
pub fn block_updates<V: CommittedVersions>(
    block: &Block,
    validation_info: &[ValidationInfo],
    versions: &V,
) -> Result<(BTreeMap<String, DbUpdates>, Vec<TxDataForProvenance>), V::Error> {
    let number = block.number();
    let mut updates: BTreeMap<String, DbUpdates> = BTreeMap::new();
    let mut provenance = vec![];

    match &block.payload {
        BlockPayload::DataTxs(envelopes) => {
            for (tx_num, envelope) in envelopes.iter().enumerate() {
                let payload = &envelope.payload;
                let submitter = payload.must_sign_user_ids.first().cloned().unwrap_or_default();
                if !validation_info[tx_num].is_valid() {
                    provenance.push(TxDataForProvenance {
                        user_id: submitter,
                        tx_id: payload.tx_id.clone(),
                        tx_index: tx_num as u64,
                        is_valid: false,
                        ..Default::default()
                    });
                    continue;
                }
                let version = Version::new(number, tx_num as u64);
                for op in &payload.db_operations {
                    let mut data = TxDataForProvenance {
                        db_name: op.db_name.clone(),
                        user_id: submitter.clone(),
                        tx_id: payload.tx_id.clone(),
                        tx_index: tx_num as u64,
                        is_valid: true,
                        ..Default::default()
                    };
                    let db_updates = updates.entry(op.db_name.clone()).or_default();
                    for write in &op.writes {
                        if let Some(old_version) = versions.version_of(&op.db_name, &write.key)? {
                            data.old_version_of_writes.insert(write.key.clone(), old_version);
                        }
                        let kv = KvWithMetadata {
                            key: write.key.clone(),
                            value: write.value.clone(),
                            metadata: Metadata { version, access_control: write.acl.clone() },
                        };
                        db_updates.writes.push(kv.clone());
                        data.writes.push(kv);
                    }
                    for delete in &op.deletes {
                        let last_version = versions
                            .version_of(&op.db_name, &delete.key)?
                            .unwrap_or_default();
                        db_updates.deletes.push(delete.key.clone());
                        data.deletes
                            .push(KeyWithVersion { key: delete.key.clone(), version: last_version });
                    }
                    data.reads = op
                        .reads
                        .iter()
                        .map(|read| KeyWithVersion { key: read.key.clone(), version: read.version })
                        .collect();
                    provenance.push(data);
                }
                if payload.db_operations.is_empty() {
                    provenance.push(TxDataForProvenance {
                        user_id: submitter,
                        tx_id: payload.tx_id.clone(),
                        tx_index: tx_num as u64,
                        is_valid: true,
                        ..Default::default()
                    });
                }
            }
        }
        BlockPayload::ConfigTx(envelope) => {
            let payload = &envelope.payload;
            let valid = validation_info[0].is_valid();
            let mut data = TxDataForProvenance {
                db_name: CONFIG_DB.to_string(),
                user_id: payload.user_id.clone(),
                tx_id: payload.tx_id.clone(),
                tx_index: 0,
                is_valid: valid,
                ..Default::default()
            };
            if valid {
                let version = Version::new(number, 0);
                let previous = versions.committed_config()?;
                if let Some((_, old_version)) = &previous {
                    data.old_version_of_writes.insert(CONFIG_KEY.to_string(), *old_version);
                }
                let config_kv = KvWithMetadata {
                    key: CONFIG_KEY.to_string(),
                    value: canonical_bytes(&payload.new_config),
                    metadata: Metadata { version, access_control: None },
                };
                updates.entry(CONFIG_DB.to_string()).or_default().writes.push(config_kv.clone());
                data.writes.push(config_kv);

                // Admins materialize as user records so the validator and
                // query processors can resolve them.
                let users = updates.entry(USERS_DB.to_string()).or_default();
                for admin in &payload.new_config.admins {
                    let user = User {
                        id: admin.id.clone(),
                        verifying_key: admin.verifying_key,
                        privilege: Privilege { db_permission: BTreeMap::new(), admin: true },
                    };
                    users.writes.push(KvWithMetadata {
                        key: user_key(&admin.id),
                        value: canonical_bytes(&user),
                        metadata: Metadata { version, access_control: None },
                    });
                }
                if let Some((old_config, _)) = previous {
                    for admin in &old_config.admins {
                        if !payload.new_config.admins.iter().any(|new| new.id == admin.id) {
                            users.deletes.push(user_key(&admin.id));
                        }
                    }
                }
            }
            provenance.push(data);
        }
        BlockPayload::DbAdminTx(envelope) => {
            let payload = &envelope.payload;
            let valid = validation_info[0].is_valid();
            let mut data = TxDataForProvenance {
                db_name: DATABASES_DB.to_string(),
                user_id: payload.user_id.clone(),
                tx_id: payload.tx_id.clone(),
                tx_index: 0,
                is_valid: valid,
                ..Default::default()
            };
            if valid {
                let version = Version::new(number, 0);
                let catalogue = updates.entry(DATABASES_DB.to_string()).or_default();
                for db_name in &payload.create_dbs {
                    let kv = KvWithMetadata {
                        key: db_name.clone(),
                        value: vec![],
                        metadata: Metadata { version, access_control: None },
                    };
                    catalogue.writes.push(kv.clone());
                    data.writes.push(kv);
                }
                for db_name in &payload.delete_dbs {
                    let last_version =
                        versions.version_of(DATABASES_DB, db_name)?.unwrap_or_default();
                    catalogue.deletes.push(db_name.clone());
                    data.deletes
                        .push(KeyWithVersion { key: db_name.clone(), version: last_version });
                }
            }
            provenance.push(data);
        }
        BlockPayload::UserAdminTx(envelope) => {
            let payload = &envelope.payload;
            let valid = validation_info[0].is_valid();
            let mut data = TxDataForProvenance {
                db_name: USERS_DB.to_string(),
                user_id: payload.user_id.clone(),
                tx_id: payload.tx_id.clone(),
                tx_index: 0,
                is_valid: valid,
                ..Default::default()
            };
            if valid {
                let version = Version::new(number, 0);
                let users = updates.entry(USERS_DB.to_string()).or_default();
                for user_write in &payload.user_writes {
                    let key = user_key(&user_write.user.id);
                    if let Some(old_version) = versions.version_of(USERS_DB, &key)? {
                        data.old_version_of_writes.insert(key.clone(), old_version);
                    }
                    let kv = KvWithMetadata {
                        key,
                        value: canonical_bytes(&user_write.user),
                        metadata: Metadata { version, access_control: user_write.acl.clone() },
                    };
                    users.writes.push(kv.clone());
                    data.writes.push(kv);
                }
                for user_id in &payload.user_deletes {
                    let key = user_key(user_id);
                    let last_version = versions.version_of(USERS_DB, &key)?.unwrap_or_default();
                    users.deletes.push(key.clone());
                    data.deletes.push(KeyWithVersion { key, version: last_version });
                }
            }
            provenance.push(data);
        }
    }
    Ok((updates, provenance))
}
