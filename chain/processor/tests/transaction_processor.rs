use assert_matches::assert_matches;
use ledger_crypto::InMemorySigner;
use ledger_primitives::cluster::{Admin, ClusterConfig, NodeConfig};
use ledger_primitives::transaction::{
    canonical_bytes, ConfigTx, ConfigTxEnvelope, DataRead, DataTx, DataTxEnvelope, DataWrite,
    DbAdminTx, DbAdminTxEnvelope, DbOperation, Transaction, UserAdminTx, UserAdminTxEnvelope,
    UserWrite,
};
use ledger_primitives::types::{
    user_key, Access, KvWithMetadata, Metadata, Privilege, User, Version, DEFAULT_DB, USERS_DB,
};
use ledger_primitives::validation::Flag;
use ledger_processor::{
    BlockStoreLedger, ProcessorConfig, SubmitOutcome, TransactionProcessor, TxError,
};
use ledger_replication::{BlockReplicator, InProcTransport, PeerConfig, ReplicationConfig};
use ledger_store::blockstore::{BlockStore, BlockStoreConfig};
use ledger_store::provenance::ProvenanceStore;
use ledger_store::worldstate::{DbUpdates, StateStore, StateStoreConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TestEnv {
    _dir: tempfile::TempDir,
    state: Arc<StateStore>,
    block_store: Arc<BlockStore>,
    provenance: Arc<ProvenanceStore>,
    processor: TransactionProcessor,
    admin: InMemorySigner,
    user: InMemorySigner,
}

fn new_env(max_tx_count_per_batch: usize) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(
        StateStore::open(StateStoreConfig::new(dir.path().join("worldstate"))).unwrap(),
    );
    let block_store =
        Arc::new(BlockStore::open(BlockStoreConfig::new(dir.path().join("blockstore"))).unwrap());
    let provenance = Arc::new(ProvenanceStore::open(dir.path().join("provenance")).unwrap());

    let transport = InProcTransport::new();
    let inbox = transport.register(1);
    let peers = vec![PeerConfig { raft_id: 1, host_port: "127.0.0.1:7050".to_string() }];
    let replicator = Arc::new(
        BlockReplicator::start(
            ReplicationConfig::new(1, peers, dir.path().join("raft")),
            transport as Arc<dyn ledger_replication::Transport>,
            inbox,
            Arc::new(BlockStoreLedger(Arc::clone(&block_store))),
        )
        .unwrap(),
    );
    let processor = TransactionProcessor::start(
        ProcessorConfig {
            tx_queue_depth: 100,
            batch_queue_depth: 100,
            max_tx_count_per_batch,
            batch_timeout: Duration::from_millis(50),
        },
        Arc::clone(&state),
        Arc::clone(&block_store),
        Arc::clone(&provenance),
        replicator,
    );
    assert!(wait_until(Duration::from_secs(30), || processor.is_leader().is_ok()));

    TestEnv {
        _dir: dir,
        state,
        block_store,
        provenance,
        processor,
        admin: InMemorySigner::from_seed("admin", "admin"),
        user: InMemorySigner::from_seed("testUser", "testUser"),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

impl TestEnv {
    /// Boots the ledger with the genesis config block, then registers the
    /// test user the way the original processor tests seed identities:
    /// directly in the users database.
    fn setup(&self, user_db: &str) {
        let config_tx = ConfigTx {
            user_id: self.admin.id.clone(),
            tx_id: "genesis-tx".to_string(),
            read_old_config_version: Version::default(),
            new_config: ClusterConfig {
                nodes: vec![NodeConfig {
                    id: "node1".to_string(),
                    raft_id: 1,
                    address: "127.0.0.1".to_string(),
                    port: 7050,
                    verifying_key: InMemorySigner::from_seed("node1", "node1").public_key,
                }],
                admins: vec![Admin {
                    id: self.admin.id.clone(),
                    verifying_key: self.admin.public_key,
                }],
            },
        };
        let signature = self.admin.sign(&canonical_bytes(&config_tx)).to_vec();
        let outcome = self
            .processor
            .submit_transaction(
                Transaction::Config(ConfigTxEnvelope { payload: config_tx, signature }),
                Some(Duration::from_secs(10)),
            )
            .unwrap();
        assert_matches!(outcome, SubmitOutcome::Receipt(receipt) if receipt.header.number() == 1);

        let user = User {
            id: self.user.id.clone(),
            verifying_key: self.user.public_key,
            privilege: Privilege {
                db_permission: BTreeMap::from([(user_db.to_string(), Access::ReadWrite)]),
                admin: false,
            },
        };
        let updates = BTreeMap::from([(
            USERS_DB.to_string(),
            DbUpdates {
                writes: vec![KvWithMetadata {
                    key: user_key(&user.id),
                    value: borsh::to_vec(&user).unwrap(),
                    metadata: Metadata { version: Version::new(1, 1), access_control: None },
                }],
                deletes: vec![],
            },
        )]);
        self.state.commit(&updates, 1).unwrap();
    }

    fn signed_data_tx(&self, tx_id: &str, ops: Vec<DbOperation>) -> Transaction {
        self.signed_data_tx_by(&self.user, tx_id, ops)
    }

    fn signed_data_tx_by(
        &self,
        signer: &InMemorySigner,
        tx_id: &str,
        ops: Vec<DbOperation>,
    ) -> Transaction {
        let payload = DataTx {
            must_sign_user_ids: vec![self.user.id.clone()],
            tx_id: tx_id.to_string(),
            db_operations: ops,
        };
        let signature = signer.sign(&canonical_bytes(&payload)).to_vec();
        Transaction::Data(DataTxEnvelope {
            payload,
            signatures: BTreeMap::from([(self.user.id.clone(), signature)]),
        })
    }
}

fn write_op(db_name: &str, key: &str, value: &[u8]) -> DbOperation {
    DbOperation {
        db_name: db_name.to_string(),
        reads: vec![],
        writes: vec![DataWrite { key: key.to_string(), value: value.to_vec(), acl: None }],
        deletes: vec![],
    }
}

#[test]
fn commit_a_data_transaction() {
    let env = new_env(1);
    env.setup(DEFAULT_DB);

    let tx = env.signed_data_tx("tx1", vec![write_op(DEFAULT_DB, "test-key1", b"test-value1")]);
    let outcome = env.processor.submit_transaction(tx, Some(Duration::from_secs(10))).unwrap();
    let SubmitOutcome::Receipt(receipt) = outcome else {
        panic!("expected a receipt, got {outcome:?}");
    };
    assert_eq!(receipt.header.number(), 2);
    assert_eq!(receipt.tx_index, 0);

    let record = env.state.get(DEFAULT_DB, "test-key1").unwrap().unwrap();
    assert_eq!(record.value, b"test-value1");
    assert_eq!(record.metadata.version, Version::new(2, 0));
    assert_eq!(env.state.height().unwrap(), 2);
    assert_eq!(env.block_store.height(), 2);

    let block = env.block_store.get(2).unwrap();
    assert_eq!(block.header.validation_info[0].flag, Flag::Valid);
    assert_eq!(
        block.header.base_header.previous_base_header_hash,
        env.block_store.get_base_header_hash(1).unwrap()
    );
    assert_eq!(
        block.header.base_header.last_committed_block_hash,
        env.block_store.get_hash(1).unwrap()
    );
    assert_eq!(block.header.base_header.last_committed_block_num, 1);
    assert_eq!(block.header.skipchain_hashes, vec![env.block_store.get_hash(1).unwrap()]);
    assert_eq!(receipt.header, block.header);

    assert_eq!(
        env.provenance.get_values(DEFAULT_DB, "test-key1").unwrap(),
        vec![(b"test-value1".to_vec(), Version::new(2, 0))]
    );
    assert_eq!(env.provenance.get_tx_locator("tx1").unwrap(), Some((2, 0)));
    assert_eq!(env.provenance.height().unwrap(), 2);
}

#[test]
fn duplicate_tx_ids_are_rejected() {
    let env = new_env(1);
    env.setup(DEFAULT_DB);

    let tx = env.signed_data_tx("tx1", vec![write_op(DEFAULT_DB, "k1", b"v1")]);
    env.processor.submit_transaction(tx, None).unwrap();
    // A second submission with the same id while the first is pending.
    let dup = env.signed_data_tx("tx1", vec![write_op(DEFAULT_DB, "k2", b"v2")]);
    assert_matches!(
        env.processor.submit_transaction(dup, None),
        Err(TxError::AlreadyExists { .. })
    );

    assert!(wait_until(Duration::from_secs(10), || env.block_store.height() == 2));

    // Resubmitting a committed id is flagged by the validator, never
    // committed twice.
    let again = env.signed_data_tx("tx1", vec![write_op(DEFAULT_DB, "k3", b"v3")]);
    let err = env.processor.submit_transaction(again, Some(Duration::from_secs(10))).unwrap_err();
    assert_matches!(err, TxError::Invalid { flag: Flag::InvalidIncorrectEntries, .. });
    assert_eq!(env.state.get(DEFAULT_DB, "k3").unwrap(), None);
}

#[test]
fn zero_timeout_returns_immediately() {
    let env = new_env(1);
    env.setup(DEFAULT_DB);

    let tx = env.signed_data_tx("tx1", vec![write_op(DEFAULT_DB, "k1", b"v1")]);
    let outcome =
        env.processor.submit_transaction(tx, Some(Duration::from_millis(0))).unwrap();
    assert_eq!(outcome, SubmitOutcome::Submitted);

    // The transaction still commits asynchronously.
    assert!(wait_until(Duration::from_secs(10), || {
        env.state.get(DEFAULT_DB, "k1").unwrap().is_some()
    }));
}

#[test]
fn invalid_signature_is_flagged_not_committed() {
    let env = new_env(1);
    env.setup(DEFAULT_DB);

    let forger = InMemorySigner::from_seed("forger", "forger");
    let tx = env.signed_data_tx_by(&forger, "tx1", vec![write_op(DEFAULT_DB, "k1", b"v1")]);
    let err = env.processor.submit_transaction(tx, Some(Duration::from_secs(10))).unwrap_err();
    assert_matches!(err, TxError::Invalid { flag: Flag::InvalidSignature, .. });

    // The block exists with the invalid flag; state is untouched.
    assert_eq!(env.block_store.height(), 2);
    let block = env.block_store.get(2).unwrap();
    assert_eq!(block.header.validation_info[0].flag, Flag::InvalidSignature);
    assert_eq!(env.state.get(DEFAULT_DB, "k1").unwrap(), None);
    // Only the submitter and locator links reach provenance.
    assert_eq!(env.provenance.get_tx_locator("tx1").unwrap(), Some((2, 0)));
    assert!(env.provenance.get_values(DEFAULT_DB, "k1").unwrap().is_empty());
}

#[test]
fn conflicting_writes_within_one_block() {
    let env = new_env(10);
    env.setup(DEFAULT_DB);

    let first = env.signed_data_tx("tx1", vec![write_op(DEFAULT_DB, "k", b"first")]);
    let second = env.signed_data_tx("tx2", vec![write_op(DEFAULT_DB, "k", b"second")]);
    env.processor.submit_transaction(first, None).unwrap();
    env.processor.submit_transaction(second, None).unwrap();

    assert!(wait_until(Duration::from_secs(10), || env.block_store.height() == 2));
    let block = env.block_store.get(2).unwrap();
    assert_eq!(block.tx_count(), 2);
    assert_eq!(block.header.validation_info[0].flag, Flag::Valid);
    assert_eq!(
        block.header.validation_info[1].flag,
        Flag::InvalidMvccConflictWithinBlock
    );
    // State reflects only the first write.
    assert_eq!(env.state.get(DEFAULT_DB, "k").unwrap().unwrap().value, b"first");
}

#[test]
fn stale_read_set_is_an_mvcc_conflict() {
    let env = new_env(1);
    env.setup(DEFAULT_DB);

    let tx = env.signed_data_tx("tx1", vec![write_op(DEFAULT_DB, "k", b"v1")]);
    env.processor.submit_transaction(tx, Some(Duration::from_secs(10))).unwrap();

    // Read set observed the key before the write above committed.
    let stale = env.signed_data_tx(
        "tx2",
        vec![DbOperation {
            db_name: DEFAULT_DB.to_string(),
            reads: vec![DataRead { key: "k".to_string(), version: Version::default() }],
            writes: vec![DataWrite { key: "k".to_string(), value: b"v2".to_vec(), acl: None }],
            deletes: vec![],
        }],
    );
    let err = env.processor.submit_transaction(stale, Some(Duration::from_secs(10))).unwrap_err();
    assert_matches!(err, TxError::Invalid { flag: Flag::InvalidMvccConflict, .. });
    assert_eq!(env.state.get(DEFAULT_DB, "k").unwrap().unwrap().value, b"v1");
}

#[test]
fn administrative_flow_creates_users_and_databases() {
    let env = new_env(1);
    env.setup(DEFAULT_DB);

    // Create a database.
    let create_db = DbAdminTx {
        user_id: env.admin.id.clone(),
        tx_id: "create-db1".to_string(),
        create_dbs: vec!["db1".to_string()],
        delete_dbs: vec![],
    };
    let signature = env.admin.sign(&canonical_bytes(&create_db)).to_vec();
    env.processor
        .submit_transaction(
            Transaction::DbAdmin(DbAdminTxEnvelope { payload: create_db, signature }),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
    assert!(env.state.exists("db1"));
    assert_eq!(env.state.list_user_dbs().unwrap(), vec!["db1".to_string()]);

    // Grant the test user access to it.
    let updated_user = User {
        id: env.user.id.clone(),
        verifying_key: env.user.public_key,
        privilege: Privilege {
            db_permission: BTreeMap::from([
                (DEFAULT_DB.to_string(), Access::ReadWrite),
                ("db1".to_string(), Access::ReadWrite),
            ]),
            admin: false,
        },
    };
    let user_admin = UserAdminTx {
        user_id: env.admin.id.clone(),
        tx_id: "grant-db1".to_string(),
        user_writes: vec![UserWrite { user: updated_user, acl: None }],
        user_deletes: vec![],
    };
    let signature = env.admin.sign(&canonical_bytes(&user_admin)).to_vec();
    env.processor
        .submit_transaction(
            Transaction::UserAdmin(UserAdminTxEnvelope { payload: user_admin, signature }),
            Some(Duration::from_secs(10)),
        )
        .unwrap();

    // The grant is effective for data transactions.
    let tx = env.signed_data_tx("write-db1", vec![write_op("db1", "k", b"v")]);
    env.processor.submit_transaction(tx, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(env.state.get("db1", "k").unwrap().unwrap().value, b"v");

    // Non-admin users cannot administer databases.
    let rogue = DbAdminTx {
        user_id: env.user.id.clone(),
        tx_id: "rogue-create".to_string(),
        create_dbs: vec!["db2".to_string()],
        delete_dbs: vec![],
    };
    let signature = env.user.sign(&canonical_bytes(&rogue)).to_vec();
    let err = env
        .processor
        .submit_transaction(
            Transaction::DbAdmin(DbAdminTxEnvelope { payload: rogue, signature }),
            Some(Duration::from_secs(10)),
        )
        .unwrap_err();
    assert_matches!(err, TxError::Invalid { flag: Flag::InvalidUnauthorisedAdmin, .. });
    assert!(!env.state.exists("db2"));

    // Drop the database again.
    let delete_db = DbAdminTx {
        user_id: env.admin.id.clone(),
        tx_id: "delete-db1".to_string(),
        create_dbs: vec![],
        delete_dbs: vec!["db1".to_string()],
    };
    let signature = env.admin.sign(&canonical_bytes(&delete_db)).to_vec();
    env.processor
        .submit_transaction(
            Transaction::DbAdmin(DbAdminTxEnvelope { payload: delete_db, signature }),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
    assert!(!env.state.exists("db1"));
}

#[test]
fn close_drains_pending_promises() {
    let env = new_env(100);
    env.setup(DEFAULT_DB);

    let tx = env.signed_data_tx("tx-close", vec![write_op(DEFAULT_DB, "k", b"v")]);
    env.processor.submit_transaction(tx, None).unwrap();
    env.processor.close();
    assert!(env.processor.pending_txs().is_empty());
    assert_matches!(
        env.processor.submit_transaction(
            env.signed_data_tx("tx-after", vec![]),
            None
        ),
        Err(TxError::Shutdown)
    );
}
