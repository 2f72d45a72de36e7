use ledger_crypto::{PublicKey, Signature};
use ledger_store::worldstate::WorldStateError;
use ledger_store::IdentityQuerier;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Verifies user signatures against the verifying keys registered in the
/// users database. Parsed keys may be cached; the cache is invalidated when a
/// user administration block commits, and stays disabled unless explicitly
/// switched on.
pub struct SignatureVerifier {
    identity: IdentityQuerier,
    cache_enabled: bool,
    key_cache: RwLock<HashMap<String, PublicKey>>,
}

impl SignatureVerifier {
    pub fn new(identity: IdentityQuerier) -> Self {
        SignatureVerifier { identity, cache_enabled: false, key_cache: RwLock::new(HashMap::new()) }
    }

    pub fn with_cache(identity: IdentityQuerier) -> Self {
        SignatureVerifier { identity, cache_enabled: true, key_cache: RwLock::new(HashMap::new()) }
    }

    fn verifying_key(&self, user_id: &str) -> Result<Option<PublicKey>, WorldStateError> {
        if self.cache_enabled {
            if let Some(key) = self.key_cache.read().get(user_id) {
                return Ok(Some(*key));
            }
        }
        let Some(key) = self.identity.get_verifying_key(user_id)? else {
            return Ok(None);
        };
        if self.cache_enabled {
            self.key_cache.write().insert(user_id.to_string(), key);
        }
        Ok(Some(key))
    }

    /// True when `signature` is a valid signature of `body` by the registered
    /// key of `user_id`. Unknown users and malformed signatures verify false.
    pub fn verify(
        &self,
        user_id: &str,
        signature: &[u8],
        body: &[u8],
    ) -> Result<bool, WorldStateError> {
        let Some(key) = self.verifying_key(user_id)? else {
            debug!(target: "validator", user_id, "signature from unknown user");
            return Ok(false);
        };
        let Ok(signature) = Signature::try_from_slice(signature) else {
            return Ok(false);
        };
        Ok(key.verify(body, &signature))
    }

    /// Drops all cached keys. Wired to committed user administration blocks.
    pub fn invalidate(&self) {
        self.key_cache.write().clear();
    }
}
