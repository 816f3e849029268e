//! Cryptographic primitives used across the simulator: SHA-256 hashing and
//! Ed25519 keypairs behind thin newtypes.
//!
//! All envelope authentication goes through this boundary; the consensus
//! core never touches `ed25519_dalek` types directly.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("verification failed")]
    VerificationFailed,
}

/// A SHA-256 hash, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// Hashes the given data.
    pub fn hash(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Hash256(hasher.finalize().into())
    }

    /// The all-zero hash, used as the genesis parent.
    pub fn zero() -> Self {
        Hash256([0; 32])
    }

    /// Combines two hashes into one, for Merkle tree nodes.
    pub fn aggregate(&self, other: &Self) -> Self {
        let mut data = [0; 64];
        data[..32].copy_from_slice(&self.0);
        data[32..].copy_from_slice(&other.0);
        Hash256::hash(data)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidFormat("hash must be 32 bytes".to_string()))?;
        Ok(Hash256(bytes))
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Hash256({})", hex::encode(&self.0[..8]))
    }
}

impl std::str::FromStr for Hash256 {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash256::from_hex(s)
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub [u8; 32]);

/// An Ed25519 private key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrivateKey(pub [u8; 32]);

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// Signs the given message with the private key.
    pub fn sign(message: impl AsRef<[u8]>, private_key: &PrivateKey) -> Self {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&private_key.0);
        Signature(signing_key.sign(message.as_ref()).to_bytes())
    }

    /// Verifies the signature against the given message and public key.
    pub fn verify(
        &self,
        message: impl AsRef<[u8]>,
        public_key: &PublicKey,
    ) -> Result<(), CryptoError> {
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public_key.0)
            .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&self.0);
        verifying_key
            .verify(message.as_ref(), &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

/// Generates a keypair deterministically from the given seed.
pub fn generate_keypair(seed: impl AsRef<[u8]>) -> (PublicKey, PrivateKey) {
    let secret = Hash256::hash(seed).0;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
    (
        PublicKey(signing_key.verifying_key().to_bytes()),
        PrivateKey(secret),
    )
}

/// Checks whether the given public and private keys match.
pub fn check_keypair_match(public_key: &PublicKey, private_key: &PrivateKey) -> bool {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&private_key.0);
    signing_key.verifying_key().to_bytes() == public_key.0
}

macro_rules! impl_hex_bytes {
    ($ty:ident, $len:expr) => {
        impl $ty {
            pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
                let bytes =
                    hex::decode(s).map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
                let bytes: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| CryptoError::InvalidFormat(format!("expected {} bytes", $len)))?;
                Ok($ty(bytes))
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($ty), hex::encode(&self.0[..8]))
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $ty::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_hex_bytes!(PublicKey, 32);
impl_hex_bytes!(PrivateKey, 32);
impl_hex_bytes!(Signature, 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_is_deterministic() {
        let (pk1, sk1) = generate_keypair("node-0");
        let (pk2, sk2) = generate_keypair("node-0");
        assert_eq!(pk1, pk2);
        assert_eq!(sk1, sk2);
        assert!(check_keypair_match(&pk1, &sk1));

        let (pk3, _) = generate_keypair("node-1");
        assert_ne!(pk1, pk3);
    }

    #[test]
    fn sign_and_verify() {
        let (pk, sk) = generate_keypair("signer");
        let signature = Signature::sign(b"message", &sk);
        assert!(signature.verify(b"message", &pk).is_ok());
        assert_eq!(
            signature.verify(b"other message", &pk),
            Err(CryptoError::VerificationFailed)
        );

        let (other_pk, _) = generate_keypair("someone else");
        assert_eq!(
            signature.verify(b"message", &other_pk),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn hash_hex_roundtrip() {
        let hash = Hash256::hash(b"hello");
        let parsed: Hash256 = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(Hash256::zero().to_string(), "0".repeat(64));
    }
}
