pub use crate::committer::{block_updates, CommittedVersions, StateVersions};
pub use crate::errors::{SubmitOutcome, TxError};
pub use crate::pending::{CompletionPromise, PendingTxs};
pub use crate::processor::{BlockStoreLedger, ProcessorConfig, TransactionProcessor};
pub use crate::validator::{SignatureVerifier, Validator, ValidatorError};

mod batcher;
mod committer;
mod creator;
mod errors;
mod pending;
mod processor;
mod validator;
