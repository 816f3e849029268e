//! The deterministic transaction executor.
//!
//! State is a flat key-value map per node. A transaction is admitted only
//! if its signature verifies under the TX domain, its nonce is exactly one
//! past the sender's stored nonce, and it touches a key under the sender's
//! own prefix. Rejected transactions leave the state untouched.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tendersim_common::codec::{canonical, encode_tx_for_signing, CodecError};
use tendersim_common::merkle::OneshotMerkleTree;
use tendersim_common::{Block, ChainId, Hash256, PublicKey, Transaction};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("transaction is not signed")]
    MissingSignature,
    #[error("sender is not a valid public key: {0}")]
    MalformedSender(String),
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("sender {sender} does not own key {key}")]
    OwnershipViolation { sender: String, key: String },
    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// Per-node deterministic execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    chain_id: ChainId,
    state: BTreeMap<String, serde_json::Value>,
    nonces: BTreeMap<String, u64>,
}

impl ExecutionState {
    pub fn new(chain_id: ChainId) -> Self {
        ExecutionState {
            chain_id,
            state: BTreeMap::new(),
            nonces: BTreeMap::new(),
        }
    }

    /// Applies a single transaction.
    ///
    /// With `require_signature` the sender must be the hex of its public
    /// key and the signature must verify under the TX domain. Scenario
    /// blocks with synthetic senders pass `false`.
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        require_signature: bool,
    ) -> Result<(), ExecutionError> {
        if require_signature {
            let public_key = PublicKey::from_hex(&tx.sender)
                .map_err(|e| ExecutionError::MalformedSender(e.to_string()))?;
            let signature = tx.signature.ok_or(ExecutionError::MissingSignature)?;
            let message = encode_tx_for_signing(tx, &self.chain_id)?;
            if signature.verify(&message, &public_key).is_err() {
                debug!("rejecting transaction with bad signature from {}", tx.sender);
                return Err(ExecutionError::InvalidSignature(tx.sender.clone()));
            }
        }

        // Replay protection: the nonce must advance by exactly one.
        let expected = self.nonce(&tx.sender) + 1;
        if tx.nonce != expected {
            debug!(
                "rejecting transaction from {}: nonce {} (expected {})",
                tx.sender, tx.nonce, expected
            );
            return Err(ExecutionError::InvalidNonce {
                expected,
                got: tx.nonce,
            });
        }

        if !tx.key.starts_with(&format!("{}/", tx.sender)) {
            return Err(ExecutionError::OwnershipViolation {
                sender: tx.sender.clone(),
                key: tx.key.clone(),
            });
        }

        self.state.insert(tx.key.clone(), tx.value.clone());
        self.nonces.insert(tx.sender.clone(), tx.nonce);
        Ok(())
    }

    /// Applies a block's transactions in order and returns the resulting
    /// state root.
    pub fn apply_block(
        &mut self,
        block: &Block,
        require_signature: bool,
    ) -> Result<Hash256, ExecutionError> {
        for tx in &block.txs {
            self.apply_transaction(tx, require_signature)?;
        }
        Ok(self.state_root())
    }

    /// The Merkle root over `sha256(canonical([key, value]))` leaves in
    /// sorted key order. An empty state hashes the empty byte string.
    pub fn state_root(&self) -> Hash256 {
        let leaves = self
            .state
            .iter()
            .map(|(key, value)| {
                let leaf = canonical(&serde_json::json!([key, value])).unwrap();
                Hash256::hash(leaf)
            })
            .collect();
        OneshotMerkleTree::create(leaves).root()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.get(key)
    }

    pub fn nonce(&self, sender: &str) -> u64 {
        self.nonces.get(sender).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "chain_id": self.chain_id,
            "state": self.state,
            "nonces": self.nonces,
        })
    }
}
