use crate::config::LedgerConfig;
use ledger_primitives::transaction::{canonical_bytes, ConfigTx, ConfigTxEnvelope, Transaction};
use ledger_primitives::types::Version;

/// Builds the genesis configuration transaction from the bootstrap cluster
/// config. The leader submits it as block 1; it is signed with the node's
/// operator key on behalf of the first configured admin.
pub(crate) fn prepare_config_tx(
    config: &LedgerConfig,
    signer: &ledger_crypto::InMemorySigner,
) -> Transaction {
    let payload = ConfigTx {
        user_id: config
            .cluster
            .admins
            .first()
            .map(|admin| admin.id.clone())
            .unwrap_or_default(),
        tx_id: format!("genesis-{:016x}", rand::random::<u64>()),
        read_old_config_version: Version::default(),
        new_config: config.cluster.clone(),
    };
    let signature = signer.sign(&canonical_bytes(&payload)).to_vec();
    Transaction::Config(ConfigTxEnvelope { payload, signature })
}
