pub use crate::key_file::KeyFile;
pub use crate::signature::{ParseKeyError, PublicKey, SecretKey, Signature};
pub use crate::signer::InMemorySigner;

mod key_file;
mod signature;
mod signer;
