use crate::key_file::KeyFile;
use crate::signature::{PublicKey, SecretKey, Signature};

/// Signer holding its key material in memory. Used for the node operator key
/// and for client identities in tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InMemorySigner {
    pub id: String,
    pub public_key: PublicKey,
    secret_key: SecretKey,
}

impl InMemorySigner {
    pub fn new(id: String, secret_key: SecretKey) -> Self {
        InMemorySigner { id, public_key: secret_key.public_key(), secret_key }
    }

    pub fn from_seed(id: &str, seed: &str) -> Self {
        Self::new(id.to_string(), SecretKey::from_seed(seed))
    }

    pub fn from_random(id: &str) -> Self {
        Self::new(id.to_string(), SecretKey::from_random())
    }

    pub fn from_key_file(key_file: KeyFile) -> Self {
        Self::new(key_file.id, key_file.secret_key)
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.secret_key.sign(data)
    }

    pub fn to_key_file(&self) -> KeyFile {
        KeyFile {
            id: self.id.clone(),
            public_key: self.public_key,
            secret_key: self.secret_key.clone(),
        }
    }
}

impl std::fmt::Display for InMemorySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.id, self.public_key)
    }
}
