use super::{
    sign_response, GetConfigResponse, GetDataResponse, GetDbStatusResponse, GetUserResponse,
    QueryError, ResponseEnvelope, StateReader,
};
use ledger_crypto::InMemorySigner;
use ledger_store::worldstate::StateStore;
use ledger_store::IdentityQuerier;
use std::sync::Arc;

/// Serves reads of the current state. Every access is gated: the querier
/// must be a registered user holding read permission on the database, and the
/// record's access control list must admit them.
pub struct WorldstateQueryProcessor {
    state: Arc<StateStore>,
    identity: IdentityQuerier,
    signer: Arc<InMemorySigner>,
}

impl WorldstateQueryProcessor {
    pub fn new(state: Arc<StateStore>, signer: Arc<InMemorySigner>) -> Self {
        let identity = IdentityQuerier::new(Arc::clone(&state));
        WorldstateQueryProcessor { state, identity, signer }
    }

    fn require_user(&self, user_id: &str, action: &str) -> Result<(), QueryError> {
        if !self.identity.user_exists(user_id).map_err(QueryError::from)? {
            return Err(QueryError::Permission {
                user_id: user_id.to_string(),
                action: action.to_string(),
            });
        }
        Ok(())
    }
}

impl StateReader for WorldstateQueryProcessor {
    fn get_data(
        &self,
        db_name: &str,
        querier_user_id: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetDataResponse>, QueryError> {
        self.require_user(querier_user_id, "query data")?;
        if !self
            .identity
            .can_read_db(querier_user_id, db_name)
            .map_err(QueryError::from)?
        {
            return Err(QueryError::Permission {
                user_id: querier_user_id.to_string(),
                action: format!("read from database [{db_name}]"),
            });
        }
        let record = self.state.get(db_name, key)?;
        if let Some(record) = &record {
            if let Some(acl) = &record.metadata.access_control {
                if !acl.can_read(querier_user_id) {
                    return Err(QueryError::Permission {
                        user_id: querier_user_id.to_string(),
                        action: format!("read key [{key}]"),
                    });
                }
            }
        }
        let (value, metadata) =
            record.map(|record| (record.value, record.metadata)).unzip();
        Ok(sign_response(
            &self.signer,
            GetDataResponse {
                db_name: db_name.to_string(),
                key: key.to_string(),
                value,
                metadata,
            },
        ))
    }

    fn get_db_status(
        &self,
        db_name: &str,
    ) -> Result<ResponseEnvelope<GetDbStatusResponse>, QueryError> {
        Ok(sign_response(
            &self.signer,
            GetDbStatusResponse {
                db_name: db_name.to_string(),
                exists: self.state.exists(db_name),
            },
        ))
    }

    fn get_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserResponse>, QueryError> {
        self.require_user(querier_user_id, "query users")?;
        // Users can inspect themselves; everything else needs admin rights.
        if querier_user_id != target_user_id
            && !self
                .identity
                .has_admin_privilege(querier_user_id)
                .map_err(QueryError::from)?
        {
            return Err(QueryError::Permission {
                user_id: querier_user_id.to_string(),
                action: format!("read user [{target_user_id}]"),
            });
        }
        let (user, metadata) =
            self.identity.get_user(target_user_id).map_err(QueryError::from)?.unzip();
        Ok(sign_response(&self.signer, GetUserResponse { user, metadata }))
    }

    fn get_config(
        &self,
        querier_user_id: &str,
    ) -> Result<ResponseEnvelope<GetConfigResponse>, QueryError> {
        self.require_user(querier_user_id, "query the cluster configuration")?;
        let (config, metadata) = self.state.get_config()?.unzip();
        Ok(sign_response(&self.signer, GetConfigResponse { config, metadata }))
    }
}
