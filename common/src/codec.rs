//! Canonical byte encoding and the domain-separated signing encoders.
//!
//! Canonical form is compact JSON with sorted object keys; `serde_json`
//! without `preserve_order` keeps maps in `BTreeMap` order, so sorting
//! falls out of the serializer. Equal values encode to identical bytes on
//! every platform.

use crate::types::{ChainId, LedgerEntry, Transaction, Vote};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Encodes the given value canonically.
pub fn canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

fn domain_separated(
    domain: &str,
    chain_id: &str,
    payload: &impl Serialize,
) -> Result<Vec<u8>, CodecError> {
    let mut message = format!("{domain}:{chain_id}|").into_bytes();
    message.extend(canonical(payload)?);
    Ok(message)
}

/// The signing image of a transaction, under the `TX:<chain_id>|` domain.
/// The signature field is excluded.
pub fn encode_tx_for_signing(tx: &Transaction, chain_id: &ChainId) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::json!({
        "sender": tx.sender,
        "key": tx.key,
        "value": tx.value,
        "nonce": tx.nonce,
    });
    domain_separated("TX", chain_id, &payload)
}

/// The signing image of a finalized header, under `HEADER:<chain_id>|`.
pub fn encode_header_for_signing(
    entry: &LedgerEntry,
    chain_id: &ChainId,
) -> Result<Vec<u8>, CodecError> {
    domain_separated("HEADER", chain_id, entry)
}

/// The signing image of a vote, under `VOTE:<chain_id>|`.
pub fn encode_vote_for_signing(vote: &Vote, chain_id: &ChainId) -> Result<Vec<u8>, CodecError> {
    domain_separated("VOTE", chain_id, vote)
}
