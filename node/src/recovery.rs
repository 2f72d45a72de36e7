use anyhow::{bail, Context};
use ledger_primitives::cluster::ClusterConfig;
use ledger_primitives::types::{Version, CONFIG_DB, CONFIG_KEY};
use ledger_processor::{block_updates, CommittedVersions, StateVersions};
use ledger_store::blockstore::BlockStore;
use ledger_store::provenance::{ProvenanceError, ProvenanceStore};
use ledger_store::worldstate::StateStore;
use tracing::{info, warn};

/// [`CommittedVersions`] over the provenance chains, used when the state
/// store has already advanced past the block being replayed.
struct ProvenanceVersions<'a> {
    provenance: &'a ProvenanceStore,
    /// Highest version the replayed block may observe: the last transaction
    /// of the preceding block.
    ceiling: Version,
}

impl CommittedVersions for ProvenanceVersions<'_> {
    type Error = ProvenanceError;

    fn version_of(&self, db_name: &str, key: &str) -> Result<Option<Version>, Self::Error> {
        Ok(self
            .provenance
            .get_most_recent_at_or_below(db_name, key, self.ceiling)?
            .map(|(_, version)| version))
    }

    fn committed_config(&self) -> Result<Option<(ClusterConfig, Version)>, Self::Error> {
        let Some((bytes, version)) =
            self.provenance.get_most_recent_at_or_below(CONFIG_DB, CONFIG_KEY, self.ceiling)?
        else {
            return Ok(None);
        };
        let config = borsh::from_slice(&bytes)
            .map_err(|err| ProvenanceError::Corruption(err.to_string()))?;
        Ok(Some((config, version)))
    }
}

/// Brings the three stores back into agreement after a restart. The block
/// store is the source of truth: a state or provenance store that lags is
/// rolled forward by re-applying the effects of the stored blocks; a store
/// that is ahead of the block store means the ledger is corrupt.
pub(crate) fn reconcile(
    state: &StateStore,
    block_store: &BlockStore,
    provenance: &ProvenanceStore,
) -> anyhow::Result<()> {
    let ledger_height = block_store.height();
    let state_height = state.height().context("reading state store height")?;
    let provenance_height = provenance.height().context("reading provenance store height")?;

    if state_height > ledger_height || provenance_height > ledger_height {
        bail!(
            "store heights ahead of the block ledger (ledger {ledger_height}, \
             state {state_height}, provenance {provenance_height}); refusing to open"
        );
    }
    if state_height == ledger_height && provenance_height == ledger_height {
        return Ok(());
    }
    warn!(target: "ledgerdb", ledger_height, state_height, provenance_height,
          "stores lag the block ledger, rolling forward");

    for block_num in (state_height.min(provenance_height) + 1)..=ledger_height {
        let block = block_store
            .get(block_num)
            .with_context(|| format!("reading block {block_num} for replay"))?;
        let validation_info = &block.header.validation_info;

        if block_num > state_height {
            let (updates, _) = block_updates(&block, validation_info, &StateVersions { state })
                .with_context(|| format!("preparing state replay of block {block_num}"))?;
            state
                .commit(&updates, block_num)
                .with_context(|| format!("replaying block {block_num} into the state store"))?;
        }
        if block_num > provenance_height {
            let versions = ProvenanceVersions {
                provenance,
                ceiling: Version { block_num: block_num - 1, tx_num: u64::MAX },
            };
            let (_, provenance_data) = block_updates(&block, validation_info, &versions)
                .with_context(|| format!("preparing provenance replay of block {block_num}"))?;
            provenance.commit(block_num, &provenance_data).with_context(|| {
                format!("replaying block {block_num} into the provenance store")
            })?;
        }
    }
    info!(target: "ledgerdb", ledger_height, "stores rolled forward to the ledger height");
    Ok(())
}
