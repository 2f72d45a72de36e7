use crate::worldstate::{StateStore, WorldStateError};
use ledger_crypto::PublicKey;
use ledger_primitives::types::{user_key, Metadata, User, USERS_DB};
use std::sync::Arc;

/// Read-side view over the user records in the [`USERS_DB`] system database.
/// The validator resolves signers and privileges through this, the query
/// processors resolve access control.
#[derive(Clone)]
pub struct IdentityQuerier {
    state: Arc<StateStore>,
}

impl IdentityQuerier {
    pub fn new(state: Arc<StateStore>) -> Self {
        IdentityQuerier { state }
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<(User, Metadata)>, WorldStateError> {
        let Some(record) = self.state.get(USERS_DB, &user_key(user_id))? else {
            return Ok(None);
        };
        let user: User =
            borsh::from_slice(&record.value).map_err(|err| WorldStateError::Corruption {
                db_name: USERS_DB.to_string(),
                key: user_key(user_id),
                reason: err.to_string(),
            })?;
        Ok(Some((user, record.metadata)))
    }

    pub fn user_exists(&self, user_id: &str) -> Result<bool, WorldStateError> {
        Ok(self.get_user(user_id)?.is_some())
    }

    pub fn get_verifying_key(
        &self,
        user_id: &str,
    ) -> Result<Option<PublicKey>, WorldStateError> {
        Ok(self.get_user(user_id)?.map(|(user, _)| user.verifying_key))
    }

    pub fn has_admin_privilege(&self, user_id: &str) -> Result<bool, WorldStateError> {
        Ok(self.get_user(user_id)?.is_some_and(|(user, _)| user.privilege.admin))
    }

    pub fn can_read_db(&self, user_id: &str, db_name: &str) -> Result<bool, WorldStateError> {
        Ok(self
            .get_user(user_id)?
            .is_some_and(|(user, _)| user.privilege.can_read_db(db_name)))
    }

    pub fn can_write_db(&self, user_id: &str, db_name: &str) -> Result<bool, WorldStateError> {
        Ok(self
            .get_user(user_id)?
            .is_some_and(|(user, _)| user.privilege.can_write_db(db_name)))
    }
}
