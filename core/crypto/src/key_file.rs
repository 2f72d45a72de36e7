use crate::signature::{PublicKey, SecretKey};
use std::io;
use std::path::Path;

/// On-disk representation of a key pair, stored as JSON next to the node
/// configuration.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyFile {
    pub id: String,
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

impl KeyFile {
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let contents = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, contents)
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let key_file: KeyFile = serde_json::from_str(&contents)?;
        if key_file.secret_key.public_key() != key_file.public_key {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("public key in {} does not match the secret key", path.display()),
            ));
        }
        Ok(key_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::InMemorySigner;

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key.json");
        let signer = InMemorySigner::from_seed("node1", "node1");
        signer.to_key_file().write_to_file(&path).unwrap();
        let loaded = KeyFile::from_file(&path).unwrap();
        assert_eq!(loaded, signer.to_key_file());
    }

    #[test]
    fn mismatched_public_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key.json");
        let mut key_file = InMemorySigner::from_seed("node1", "node1").to_key_file();
        key_file.public_key = SecretKey::from_seed("other").public_key();
        key_file.write_to_file(&path).unwrap();
        assert!(KeyFile::from_file(&path).is_err());
    }
}
