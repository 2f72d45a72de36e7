use super::{
    sign_response, GetAccessorsResponse, GetHistoricalDataResponse, GetTxIdsSubmittedByResponse,
    GetUserAccessResponse, HistoricalValue, ProvenanceReader, QueryError, ResponseEnvelope,
    UserAccessedValue,
};
use ledger_crypto::InMemorySigner;
use ledger_primitives::types::Version;
use ledger_store::provenance::ProvenanceStore;
use ledger_store::IdentityQuerier;
use std::sync::Arc;

/// Serves the historical data queries. User-centric queries are restricted to
/// the user themselves or an admin.
pub struct ProvenanceQueryProcessor {
    provenance: Arc<ProvenanceStore>,
    identity: IdentityQuerier,
    signer: Arc<InMemorySigner>,
}

impl ProvenanceQueryProcessor {
    pub fn new(
        provenance: Arc<ProvenanceStore>,
        identity: IdentityQuerier,
        signer: Arc<InMemorySigner>,
    ) -> Self {
        ProvenanceQueryProcessor { provenance, identity, signer }
    }

    fn require_user(&self, user_id: &str) -> Result<(), QueryError> {
        if !self.identity.user_exists(user_id).map_err(QueryError::from)? {
            return Err(QueryError::Permission {
                user_id: user_id.to_string(),
                action: "query provenance data".to_string(),
            });
        }
        Ok(())
    }

    fn require_self_or_admin(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<(), QueryError> {
        self.require_user(querier_user_id)?;
        if querier_user_id != target_user_id
            && !self
                .identity
                .has_admin_privilege(querier_user_id)
                .map_err(QueryError::from)?
        {
            return Err(QueryError::Permission {
                user_id: querier_user_id.to_string(),
                action: format!("inspect accesses of user [{target_user_id}]"),
            });
        }
        Ok(())
    }

    fn historical(
        &self,
        values: Vec<(Vec<u8>, Version)>,
    ) -> ResponseEnvelope<GetHistoricalDataResponse> {
        sign_response(
            &self.signer,
            GetHistoricalDataResponse {
                values: values
                    .into_iter()
                    .map(|(value, version)| HistoricalValue { value, version })
                    .collect(),
            },
        )
    }

    fn user_access(
        &self,
        values: Vec<(String, String, Option<Vec<u8>>, Version)>,
    ) -> ResponseEnvelope<GetUserAccessResponse> {
        sign_response(
            &self.signer,
            GetUserAccessResponse {
                values: values
                    .into_iter()
                    .map(|(db_name, key, value, version)| UserAccessedValue {
                        db_name,
                        key,
                        value,
                        version,
                    })
                    .collect(),
            },
        )
    }
}

impl ProvenanceReader for ProvenanceQueryProcessor {
    fn get_historical_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.require_user(user_id)?;
        Ok(self.historical(self.provenance.get_values(db_name, key)?))
    }

    fn get_value_at(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.require_user(user_id)?;
        let values = self.provenance.get_value_at(db_name, key, version)?;
        Ok(self.historical(values.into_iter().collect()))
    }

    fn get_previous_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.require_user(user_id)?;
        Ok(self.historical(self.provenance.get_previous_values(db_name, key, version)?))
    }

    fn get_next_values(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
        version: Version,
    ) -> Result<ResponseEnvelope<GetHistoricalDataResponse>, QueryError> {
        self.require_user(user_id)?;
        Ok(self.historical(self.provenance.get_next_values(db_name, key, version)?))
    }

    fn get_values_read_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError> {
        self.require_self_or_admin(querier_user_id, target_user_id)?;
        Ok(self.user_access(self.provenance.get_values_read_by_user(target_user_id)?))
    }

    fn get_values_written_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError> {
        self.require_self_or_admin(querier_user_id, target_user_id)?;
        Ok(self.user_access(self.provenance.get_values_written_by_user(target_user_id)?))
    }

    fn get_values_deleted_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetUserAccessResponse>, QueryError> {
        self.require_self_or_admin(querier_user_id, target_user_id)?;
        Ok(self.user_access(self.provenance.get_values_deleted_by_user(target_user_id)?))
    }

    fn get_readers(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetAccessorsResponse>, QueryError> {
        self.require_user(user_id)?;
        Ok(sign_response(
            &self.signer,
            GetAccessorsResponse { users: self.provenance.get_readers(db_name, key)? },
        ))
    }

    fn get_writers(
        &self,
        user_id: &str,
        db_name: &str,
        key: &str,
    ) -> Result<ResponseEnvelope<GetAccessorsResponse>, QueryError> {
        self.require_user(user_id)?;
        Ok(sign_response(
            &self.signer,
            GetAccessorsResponse { users: self.provenance.get_writers(db_name, key)? },
        ))
    }

    fn get_tx_ids_submitted_by_user(
        &self,
        querier_user_id: &str,
        target_user_id: &str,
    ) -> Result<ResponseEnvelope<GetTxIdsSubmittedByResponse>, QueryError> {
        self.require_self_or_admin(querier_user_id, target_user_id)?;
        Ok(sign_response(
            &self.signer,
            GetTxIdsSubmittedByResponse {
                tx_ids: self.provenance.get_tx_ids_submitted_by_user(target_user_id)?,
            },
        ))
    }
}
