use super::{Validator, ValidatorError};
use ledger_primitives::transaction::{
    ConfigTxEnvelope, DbAdminTxEnvelope, UserAdminTxEnvelope,
};
use ledger_primitives::types::{is_system_db, valid_db_name, DEFAULT_DB};
use ledger_primitives::validation::{Flag, ValidationInfo};
use std::collections::HashSet;

impl Validator {
    /// Common gate for administrative transactions: a valid signature by the
    /// submitting user, who must hold the admin privilege.
    fn check_admin_signature(
        &self,
        tx_id: &str,
        user_id: &str,
        signature: &[u8],
        body: &[u8],
    ) -> Result<Option<ValidationInfo>, ValidatorError> {
        if let Some(info) = self.check_committed_tx_id(tx_id)? {
            return Ok(Some(info));
        }
        if !self.sig_verifier.verify(user_id, signature, body)? {
            return Ok(Some(ValidationInfo::invalid(
                Flag::InvalidSignature,
                format!("signature of user [{user_id}] is missing or invalid"),
            )));
        }
        if !self.identity.has_admin_privilege(user_id)? {
            return Ok(Some(ValidationInfo::invalid(
                Flag::InvalidUnauthorisedAdmin,
                format!("user [{user_id}] has no administration privilege"),
            )));
        }
        Ok(None)
    }

    pub(crate) fn validate_config_tx(
        &self,
        envelope: &ConfigTxEnvelope,
    ) -> Result<ValidationInfo, ValidatorError> {
        let payload = &envelope.payload;
        if let Some(info) = self.check_admin_signature(
            &payload.tx_id,
            &payload.user_id,
            &envelope.signature,
            &envelope.payload_bytes(),
        )? {
            return Ok(info);
        }
        if let Err(reason) = payload.new_config.validate() {
            return Ok(ValidationInfo::invalid(Flag::InvalidIncorrectEntries, reason));
        }
        let committed_version =
            self.state.get_config()?.map(|(_, metadata)| metadata.version).unwrap_or_default();
        if committed_version != payload.read_old_config_version {
            return Ok(ValidationInfo::invalid(
                Flag::InvalidMvccConflict,
                format!(
                    "cluster config was read at version {} but is committed at {}",
                    payload.read_old_config_version, committed_version
                ),
            ));
        }
        Ok(ValidationInfo::valid())
    }

    pub(crate) fn validate_db_admin_tx(
        &self,
        envelope: &DbAdminTxEnvelope,
    ) -> Result<ValidationInfo, ValidatorError> {
        let payload = &envelope.payload;
        if let Some(info) = self.check_admin_signature(
            &payload.tx_id,
            &payload.user_id,
            &envelope.signature,
            &envelope.payload_bytes(),
        )? {
            return Ok(info);
        }

        let mut seen = HashSet::new();
        for db_name in payload.create_dbs.iter().chain(&payload.delete_dbs) {
            if !valid_db_name(db_name) {
                return Ok(ValidationInfo::invalid(
                    Flag::InvalidIncorrectEntries,
                    format!("invalid database name [{db_name}]"),
                ));
            }
            if is_system_db(db_name) || db_name == DEFAULT_DB {
                return Ok(ValidationInfo::invalid(
                    Flag::InvalidIncorrectEntries,
                    format!("database [{db_name}] is reserved"),
                ));
            }
            if !seen.insert(db_name) {
                return Ok(ValidationInfo::invalid(
                    Flag::InvalidIncorrectEntries,
                    format!("database [{db_name}] occurs more than once"),
                ));
            }
        }
        Ok(ValidationInfo::valid())
    }

    pub(crate) fn validate_user_admin_tx(
        &self,
        envelope: &UserAdminTxEnvelope,
    ) -> Result<ValidationInfo, ValidatorError> {
        let payload = &envelope.payload;
        if let Some(info) = self.check_admin_signature(
            &payload.tx_id,
            &payload.user_id,
            &envelope.signature,
            &envelope.payload_bytes(),
        )? {
            return Ok(info);
        }

        let mut seen = HashSet::new();
        for user_id in payload
            .user_writes
            .iter()
            .map(|write| &write.user.id)
            .chain(&payload.user_deletes)
        {
            if user_id.is_empty() {
                return Ok(ValidationInfo::invalid(
                    Flag::InvalidIncorrectEntries,
                    "empty user id",
                ));
            }
            if !seen.insert(user_id.clone()) {
                return Ok(ValidationInfo::invalid(
                    Flag::InvalidIncorrectEntries,
                    format!("user [{user_id}] occurs more than once"),
                ));
            }
        }
        Ok(ValidationInfo::valid())
    }
}
