use super::{PendingOps, Validator, ValidatorError};
use ledger_primitives::transaction::{DataTxEnvelope, DbOperation};
use ledger_primitives::types::is_system_db;
use ledger_primitives::validation::{Flag, ValidationInfo};
use std::collections::HashSet;

impl Validator {
    /// Signature phase of a data transaction: verifies every signature on the
    /// envelope and checks that all must-sign users are among the valid ones.
    /// Returns the preliminary flag and the set of users whose signature
    /// verified.
    pub(crate) fn validate_data_signatures(
        &self,
        envelope: &DataTxEnvelope,
    ) -> Result<(ValidationInfo, Vec<String>), ValidatorError> {
        let payload = &envelope.payload;
        if payload.tx_id.is_empty() {
            return Ok((
                ValidationInfo::invalid(Flag::InvalidIncorrectEntries, "empty transaction id"),
                vec![],
            ));
        }
        if payload.must_sign_user_ids.is_empty() {
            return Ok((
                ValidationInfo::invalid(
                    Flag::InvalidIncorrectEntries,
                    "transaction names no signing users",
                ),
                vec![],
            ));
        }

        let body = envelope.payload_bytes();
        let mut valid_signers = Vec::with_capacity(envelope.signatures.len());
        for (user_id, signature) in &envelope.signatures {
            if self.sig_verifier.verify(user_id, signature, &body)? {
                valid_signers.push(user_id.clone());
            }
        }
        for user_id in &payload.must_sign_user_ids {
            if !valid_signers.contains(user_id) {
                return Ok((
                    ValidationInfo::invalid(
                        Flag::InvalidSignature,
                        format!("signature of required signer [{user_id}] is missing or invalid"),
                    ),
                    valid_signers,
                ));
            }
        }
        Ok((ValidationInfo::valid(), valid_signers))
    }

    /// Commit phase of a data transaction: permission, ACL, read-set and
    /// within-block conflict checks, in block order against the committed
    /// state.
    pub(crate) fn validate_data_commit(
        &self,
        envelope: &DataTxEnvelope,
        _valid_signers: &[String],
        pending_ops: &PendingOps,
    ) -> Result<ValidationInfo, ValidatorError> {
        let payload = &envelope.payload;

        if let Some(info) = self.check_committed_tx_id(&payload.tx_id)? {
            return Ok(info);
        }
        if let Some(info) = self.check_entries(&payload.db_operations) {
            return Ok(info);
        }

        for op in &payload.db_operations {
            if is_system_db(&op.db_name) || !self.state.exists(&op.db_name) {
                return Ok(ValidationInfo::invalid(
                    Flag::InvalidNoPermission,
                    format!("database [{}] does not exist or cannot be accessed", op.db_name),
                ));
            }
            let needs_write = !op.writes.is_empty() || !op.deletes.is_empty();
            for user_id in &payload.must_sign_user_ids {
                let allowed = if needs_write {
                    self.identity.can_write_db(user_id, &op.db_name)?
                } else {
                    self.identity.can_read_db(user_id, &op.db_name)?
                };
                if !allowed {
                    return Ok(ValidationInfo::invalid(
                        Flag::InvalidNoPermission,
                        format!(
                            "user [{user_id}] has no {} permission on database [{}]",
                            if needs_write { "write" } else { "read" },
                            op.db_name
                        ),
                    ));
                }
            }
            if let Some(info) = self.check_row_acls(payload, op)? {
                return Ok(info);
            }
            if let Some(info) = self.check_mvcc(op, pending_ops)? {
                return Ok(info);
            }
        }
        Ok(ValidationInfo::valid())
    }

    /// Structural checks: a key may appear at most once across the write and
    /// delete sets of the transaction.
    fn check_entries(&self, db_operations: &[DbOperation]) -> Option<ValidationInfo> {
        let mut touched = HashSet::new();
        for op in db_operations {
            for key in op
                .writes
                .iter()
                .map(|write| &write.key)
                .chain(op.deletes.iter().map(|delete| &delete.key))
            {
                if !touched.insert((op.db_name.clone(), key.clone())) {
                    return Some(ValidationInfo::invalid(
                        Flag::InvalidIncorrectEntries,
                        format!("key [{key}] occurs more than once in database [{}]", op.db_name),
                    ));
                }
            }
        }
        None
    }

    fn check_row_acls(
        &self,
        payload: &ledger_primitives::transaction::DataTx,
        op: &DbOperation,
    ) -> Result<Option<ValidationInfo>, ValidatorError> {
        for read in &op.reads {
            if let Some(acl) = self.state.get_acl(&op.db_name, &read.key)? {
                for user_id in &payload.must_sign_user_ids {
                    if !acl.can_read(user_id) {
                        return Ok(Some(ValidationInfo::invalid(
                            Flag::InvalidNoPermission,
                            format!("user [{user_id}] cannot read key [{}]", read.key),
                        )));
                    }
                }
            }
        }
        for key in op
            .writes
            .iter()
            .map(|write| &write.key)
            .chain(op.deletes.iter().map(|delete| &delete.key))
        {
            if let Some(acl) = self.state.get_acl(&op.db_name, key)? {
                for user_id in &payload.must_sign_user_ids {
                    if !acl.can_write(user_id) {
                        return Ok(Some(ValidationInfo::invalid(
                            Flag::InvalidNoPermission,
                            format!("user [{user_id}] cannot write key [{key}]"),
                        )));
                    }
                }
            }
        }
        Ok(None)
    }

    fn check_mvcc(
        &self,
        op: &DbOperation,
        pending_ops: &PendingOps,
    ) -> Result<Option<ValidationInfo>, ValidatorError> {
        for read in &op.reads {
            if pending_ops.exists(&op.db_name, &read.key) {
                return Ok(Some(ValidationInfo::invalid(
                    Flag::InvalidMvccConflictWithinBlock,
                    format!(
                        "key [{}] was touched by a preceding transaction in the same block",
                        read.key
                    ),
                )));
            }
            let committed = self.state.get_version(&op.db_name, &read.key)?.unwrap_or_default();
            if committed != read.version {
                return Ok(Some(ValidationInfo::invalid(
                    Flag::InvalidMvccConflict,
                    format!(
                        "key [{}] was read at version {} but is committed at {}",
                        read.key, read.version, committed
                    ),
                )));
            }
        }
        for key in op
            .writes
            .iter()
            .map(|write| &write.key)
            .chain(op.deletes.iter().map(|delete| &delete.key))
        {
            if pending_ops.exists(&op.db_name, key) {
                return Ok(Some(ValidationInfo::invalid(
                    Flag::InvalidMvccConflictWithinBlock,
                    format!(
                        "key [{key}] was touched by a preceding transaction in the same block"
                    ),
                )));
            }
        }
        Ok(None)
    }
}
