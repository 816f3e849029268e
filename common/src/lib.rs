//! Types, canonical encoding and cryptography shared by every Tendersim
//! crate.

pub mod codec;
pub mod crypto;
pub mod merkle;
mod types;

pub use crypto::{
    check_keypair_match, generate_keypair, CryptoError, Hash256, PrivateKey, PublicKey, Signature,
};
pub use types::*;
