pub use crate::config::{ConfigValidationError, LedgerConfig, CONFIG_FILENAME, NODE_KEY_FILE};
pub use crate::queries::{
    GetAccessorsResponse, GetBlockResponse, GetConfigResponse, GetDataResponse,
    GetDbStatusResponse, GetHistoricalDataResponse, GetLedgerPathResponse, GetTxIdsSubmittedByResponse,
    GetTxProofResponse, GetTxReceiptResponse, GetUserAccessResponse, GetUserResponse,
    LedgerQueryProcessor, LedgerReader, ProvenanceQueryProcessor, ProvenanceReader, QueryError,
    ResponseEnvelope, StateReader, Submitter, WorldstateQueryProcessor,
};

pub mod config;
mod genesis;
pub mod queries;
mod recovery;
pub mod testonly;

use anyhow::Context;
use crossbeam_channel::Receiver;
use ledger_crypto::InMemorySigner;
use ledger_primitives::transaction::Transaction;
use ledger_primitives::types::BlockNum;
use ledger_processor::{
    BlockStoreLedger, ProcessorConfig, SubmitOutcome, TransactionProcessor, TxError,
};
use ledger_replication::{
    BlockReplicator, NotLeaderError, PeerConfig, RaftMessage, ReplicationConfig, Transport,
};
use ledger_store::blockstore::{BlockStore, BlockStoreConfig};
use ledger_store::provenance::ProvenanceStore;
use ledger_store::worldstate::{StateStore, StateStoreConfig};
use ledger_store::IdentityQuerier;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// A ledger node: the three commit-coupled stores, the consensus adapter,
/// the transaction pipeline and the signed read surface, wired together. The
/// network layer drives it through the narrow [`StateReader`],
/// [`LedgerReader`], [`ProvenanceReader`] and [`Submitter`] traits.
pub struct LedgerNode {
    signer: Arc<InMemorySigner>,
    state: Arc<StateStore>,
    block_store: Arc<BlockStore>,
    provenance: Arc<ProvenanceStore>,
    replicator: Arc<BlockReplicator>,
    processor: TransactionProcessor,
    worldstate_queries: WorldstateQueryProcessor,
    ledger_queries: LedgerQueryProcessor,
    provenance_queries: ProvenanceQueryProcessor,
    config: LedgerConfig,
}

impl LedgerNode {
    /// Opens (or creates) the ledger under the configured directory and
    /// starts the replication and transaction pipelines. `inbox` is this
    /// node's receiving end registered with the transport.
    pub fn open(
        config: LedgerConfig,
        signer: InMemorySigner,
        transport: Arc<dyn Transport>,
        inbox: Receiver<RaftMessage>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid node configuration")?;
        let signer = Arc::new(signer);

        let state = Arc::new(
            StateStore::open(StateStoreConfig::new(config.worldstate_dir()))
                .context("opening the state store")?,
        );
        let block_store = Arc::new(
            BlockStore::open(BlockStoreConfig::new(config.blockstore_dir()))
                .context("opening the block store")?,
        );
        let provenance = Arc::new(
            ProvenanceStore::open(config.provenance_dir())
                .context("opening the provenance store")?,
        );
        recovery::reconcile(&state, &block_store, &provenance)
            .context("reconciling stores with the block ledger")?;

        let peers: Vec<PeerConfig> = config
            .cluster
            .nodes
            .iter()
            .map(|node| PeerConfig { raft_id: node.raft_id, host_port: node.host_port() })
            .collect();
        let mut replication_config =
            ReplicationConfig::new(config.node.raft_id, peers, config.raft_dir());
        replication_config.snapshot_interval_size = config.consensus.snapshot_interval_size;
        replication_config.election_timeout_min =
            Duration::from_millis(config.consensus.election_timeout_min_ms);
        replication_config.election_timeout_max =
            Duration::from_millis(config.consensus.election_timeout_max_ms);
        replication_config.heartbeat_interval =
            Duration::from_millis(config.consensus.heartbeat_interval_ms);
        replication_config.committed_queue_depth = config.queues.block;
        let replicator = Arc::new(
            BlockReplicator::start(
                replication_config,
                transport,
                inbox,
                Arc::new(BlockStoreLedger(Arc::clone(&block_store))),
            )
            .context("starting the block replicator")?,
        );

        let processor = TransactionProcessor::start(
            ProcessorConfig {
                tx_queue_depth: config.queues.transaction,
                batch_queue_depth: config.queues.transaction_batch,
                max_tx_count_per_batch: config.consensus.max_tx_count_per_batch,
                batch_timeout: config.consensus.batch_timeout(),
            },
            Arc::clone(&state),
            Arc::clone(&block_store),
            Arc::clone(&provenance),
            Arc::clone(&replicator),
        );

        let identity = IdentityQuerier::new(Arc::clone(&state));
        let worldstate_queries =
            WorldstateQueryProcessor::new(Arc::clone(&state), Arc::clone(&signer));
        let ledger_queries = LedgerQueryProcessor::new(
            Arc::clone(&block_store),
            Arc::clone(&provenance),
            identity.clone(),
            Arc::clone(&signer),
        );
        let provenance_queries =
            ProvenanceQueryProcessor::new(Arc::clone(&provenance), identity, Arc::clone(&signer));

        info!(target: "ledgerdb", node_id = %config.node.id, "ledger node opened");
        Ok(LedgerNode {
            signer,
            state,
            block_store,
            provenance,
            replicator,
            processor,
            worldstate_queries,
            ledger_queries,
            provenance_queries,
            config,
        })
    }

    /// Drives the ledger to height 1. On the elected leader this submits the
    /// genesis config block; followers simply wait for it to replicate.
    pub fn bootstrap(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        while self.block_store.height() == 0 {
            if Instant::now() > deadline {
                anyhow::bail!("ledger did not reach the genesis block within {timeout:?}");
            }
            if self.replicator.is_leader().is_ok() {
                let genesis_tx = genesis::prepare_config_tx(&self.config, &self.signer);
                match self
                    .processor
                    .submit_transaction(genesis_tx, Some(Duration::from_secs(10)))
                {
                    Ok(SubmitOutcome::Receipt(receipt)) => {
                        info!(target: "ledgerdb", number = receipt.header.number(),
                              "genesis block committed");
                        return Ok(());
                    }
                    // A flagged submission means another node's genesis won
                    // the race; the height check above settles it.
                    Ok(_)
                    | Err(TxError::NotLeader(_))
                    | Err(TxError::Invalid { .. })
                    | Err(TxError::AlreadyExists { .. }) => {}
                    Err(err) => return Err(err).context("committing the genesis block"),
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    pub fn is_leader(&self) -> Result<(), NotLeaderError> {
        self.replicator.is_leader()
    }

    /// Height of the block ledger.
    pub fn ledger_height(&self) -> BlockNum {
        self.block_store.height()
    }

    /// Height of the state store.
    pub fn state_height(&self) -> anyhow::Result<BlockNum> {
        Ok(self.state.height()?)
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    pub fn provenance(&self) -> &Arc<ProvenanceStore> {
        &self.provenance
    }

    /// Stops the pipeline and releases the stores.
    pub fn close(&self) {
        self.processor.close();
        info!(target: "ledgerdb", node_id = %self.config.node.id, "ledger node closed");
    }
}

impl Submitter for LedgerNode {
    fn submit_transaction(
        &self,
        tx: Transaction,
        timeout: Option<Duration>,
    ) -> Result<SubmitOutcome, TxError> {
        self.processor.submit_transaction(tx, timeout)
    }
}

impl StateReader for LedgerNode {
    fn get_data(
        &self,
        db_name: &str,
        querier_user_id: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetDataResponse>, QueryError> {
        self.worldstate_queries.get_data(db_name, querier_user_id, key)
    }

    fn get_db_status(
        &self,
        db_name: &str,
    ) -> Result<ResponseEnvelope<GetDbStatusResponse>, QueryError> {
        self.worldstate_queries.get_db_status(db_name)
    }

    fn get_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserResponse>, QueryError> {
        self.worldstate_queries.get_user(querier_user_id, target_user_id)
    }

    fn get_config(
        &self,
        querier_user_id: &str,
    ) -> Result<ResponseEnvelope<GetConfigResponse>, QueryError> {
        self.worldstate_queries.get_config(querier_user_id)
    }
}

impl LedgerReader for LedgerNode {
    fn get_block_header(
        &self,
        user_id: &str,
        block_num: BlockNum,
    ) -> Result<ResponseEnvelope<GetBlockResponse>, QueryError> {
        self.ledger_queries.get_block_header(user_id, block_num)
    }

    fn get_ledger_path(
        &self,
        user_id: &str,
        start: BlockNum,
        end: BlockNum,
    ) -> Result<ResponseEnvelope<GetLedgerPathResponse>, QueryError> {
        self.ledger_queries.get_ledger_path(user_id, start, end)
    }

    fn get_tx_proof(
        &self,
        user_id: &str,
        block_num: BlockNum,
        tx_index: u64,
    ) -> Result<ResponseEnvelope<GetTxProofResponse>, QueryError> {
        self.ledger_queries.get_tx_proof(user_id, block_num, tx_index)
    }

    fn get_tx_receipt(
        &self,
        user_id: &str,
        tx_id: &str,
    ) -> Result<ResponseEnvelope<GetTxReceiptResponse>, QueryError> {
        self.ledger_queries.get_tx_receipt(user_id, tx_id)
    }
}

impl ProvenanceReader for LedgerNode {
    fn get_historical_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.provenance_queries.get_historical_values(user_id, db_name, key)
    }

    fn get_value_at(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: ledger_primitives::types::Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.provenance_queries.get_value_at(user_id, db_name, key, version)
    }

    fn get_previous_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: ledger_primitives::types::Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.provenance_queries.get_previous_values(user_id, db_name, key, version)
    }

    fn get_next_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: ledger_primitives::types::Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.provenance_queries.get_next_values(user_id, db_name, key, version)
    }

    fn get_values_read_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError> {
        self.provenance_queries.get_values_read_by_user(querier_user_id, target_user_id)
    }

    fn get_values_written_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError> {
        self.provenance_queries.get_values_written_by_user(querier_user_id, target_user_id)
    }

    fn get_values_deleted_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError> {
        self.provenance_queries.get_values_deleted_by_user(querier_user_id, target_user_id)
    }

    fn get_readers(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetAccessorsResponse>, QueryError> {
        self.provenance_queries.get_readers(user_id, db_name, key)
    }

    fn get_writers(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetAccessorsResponse>, QueryError> {
        self.provenance_queries.get_writers(user_id, db_name, key)
    }

    fn get_tx_ids_submitted_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetTxIdsSubmittedByResponse>, QueryError> {
        self.provenance_queries.get_tx_ids_submitted_by_user(querier_user_id, target_user_id)
    }
}
