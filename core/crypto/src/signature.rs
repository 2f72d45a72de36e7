use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signer as _, Verifier as _};
use std::fmt;
use std::str::FromStr;

/// Prefix used when rendering keys and signatures as strings, e.g. in key
/// files and log output. Only ed25519 is supported.
const ED25519_PREFIX: &str = "ed25519";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseKeyError {
    #[error("unknown key type, expected `{ED25519_PREFIX}:` prefix: {0}")]
    UnknownKeyType(String),
    #[error("invalid base58 encoding: {0}")]
    InvalidEncoding(String),
    #[error("invalid key data length, expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// ed25519 verifying key. This is the identity material stored in user
/// records and in the cluster configuration.
#[derive(
    BorshSerialize, BorshDeserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verifies `signature` over `data`. Returns false for malformed key
    /// material as well as for a signature mismatch.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(data, &sig).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ED25519_PREFIX, bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for PublicKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = decode_key_data(s)?;
        let bytes: [u8; 32] = data
            .as_slice()
            .try_into()
            .map_err(|_| ParseKeyError::InvalidLength { expected: 32, got: data.len() })?;
        Ok(PublicKey(bytes))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// ed25519 signing key. Kept out of Debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    pub fn from_random() -> Self {
        let mut rng = rand::rngs::OsRng;
        let key = ed25519_dalek::SigningKey::generate(&mut rng);
        SecretKey(key.to_bytes())
    }

    /// Deterministic key derivation used by tests and tools.
    pub fn from_seed(seed: &str) -> Self {
        let mut bytes = [0u8; 32];
        for (i, b) in seed.bytes().enumerate().take(32) {
            bytes[i] = b;
        }
        let key = ed25519_dalek::SigningKey::from_bytes(&bytes);
        SecretKey(key.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        PublicKey(key.verifying_key().to_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature(key.sign(data).to_bytes())
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ED25519_PREFIX, bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ED25519_PREFIX}:<secret>")
    }
}

impl FromStr for SecretKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = decode_key_data(s)?;
        let bytes: [u8; 32] = data
            .as_slice()
            .try_into()
            .map_err(|_| ParseKeyError::InvalidLength { expected: 32, got: data.len() })?;
        Ok(SecretKey(bytes))
    }
}

impl serde::Serialize for SecretKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for SecretKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Detached ed25519 signature.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, ParseKeyError> {
        let bytes: [u8; 64] = data
            .try_into()
            .map_err(|_| ParseKeyError::InvalidLength { expected: 64, got: data.len() })?;
        Ok(Signature(bytes))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ED25519_PREFIX, bs58::encode(&self.0[..]).into_string())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn decode_key_data(s: &str) -> Result<Vec<u8>, ParseKeyError> {
    let data = match s.split_once(':') {
        Some((ED25519_PREFIX, data)) => data,
        Some(_) => return Err(ParseKeyError::UnknownKeyType(s.to_string())),
        None => s,
    };
    bs58::decode(data).into_vec().map_err(|err| ParseKeyError::InvalidEncoding(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let sk = SecretKey::from_seed("alice");
        let pk = sk.public_key();
        let sig = sk.sign(b"payload");
        assert!(pk.verify(b"payload", &sig));
        assert!(!pk.verify(b"tampered", &sig));
        assert!(!SecretKey::from_seed("bob").public_key().verify(b"payload", &sig));
    }

    #[test]
    fn key_string_round_trip() {
        let sk = SecretKey::from_seed("alice");
        let pk = sk.public_key();
        assert_eq!(pk, pk.to_string().parse::<PublicKey>().unwrap());
        assert_eq!(sk, sk.to_string().parse::<SecretKey>().unwrap());
        assert!("rsa:abcd".parse::<PublicKey>().is_err());
    }

    #[test]
    fn deterministic_seed() {
        assert_eq!(SecretKey::from_seed("node1"), SecretKey::from_seed("node1"));
        assert_ne!(SecretKey::from_seed("node1"), SecretKey::from_seed("node2"));
    }
}
