//! Core data types crossing the network: transactions, blocks, proposals,
//! votes and envelopes.

use crate::codec::{self, CodecError};
use crate::crypto::{Hash256, Signature};
use serde::{Deserialize, Serialize};

/// The height of a finalized block; one consensus instance per height.
pub type Height = u64;
/// An attempt number within a height; starts at 0.
pub type Round = u32;
/// Virtual time measured in milliseconds.
pub type Timestamp = u64;
/// An identifier of a node, unique within a scenario.
pub type NodeId = String;
/// The chain identifier, bound into every signing domain.
pub type ChainId = String;

/// A position within a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Step::Propose => write!(f, "PROPOSE"),
            Step::Prevote => write!(f, "PREVOTE"),
            Step::Precommit => write!(f, "PRECOMMIT"),
        }
    }
}

/// A key-value write from a single sender.
///
/// `sender` is the hex form of the sender's public key for signed
/// transactions; synthetic scenario transactions may carry an arbitrary
/// sender and no signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub key: String,
    pub value: serde_json::Value,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: Height,
    pub round: Round,
    pub parent_hash: Hash256,
    pub proposer: NodeId,
    pub txs: Vec<Transaction>,
    pub hash: Hash256,
}

impl Block {
    /// Computes the hash over every field except `hash` itself.
    pub fn compute_hash(&self) -> Result<Hash256, CodecError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("hash");
        }
        Ok(Hash256::hash(codec::canonical(&value)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub block_hash: Hash256,
    pub block: Block,
}

/// A single prevote or precommit. `block_hash = None` is the NIL vote,
/// spelled `"NIL"` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "from")]
    pub voter: NodeId,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    #[serde(with = "nil_hash")]
    pub block_hash: Option<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVote {
    #[serde(flatten)]
    pub vote: Vote,
    pub signature: Signature,
}

/// The payload of an envelope, a tagged union on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "PROPOSAL")]
    Proposal(Proposal),
    #[serde(rename = "VOTE")]
    Vote(SignedVote),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    Header,
    Body,
}

/// The atomic unit crossing the simulated network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub header_id: String,
    pub height: Height,
    pub from: NodeId,
    pub to: NodeId,
    pub payload: Payload,
}

/// A finalized block header as recorded by each node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub height: Height,
    pub parent_hash: Hash256,
    pub state_root: Hash256,
    pub proposer: NodeId,
    pub block_hash: Hash256,
}

/// Serde helper mapping `None` to the `"NIL"` sentinel.
mod nil_hash {
    use super::Hash256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const NIL: &str = "NIL";

    pub fn serialize<S: Serializer>(
        value: &Option<Hash256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(hash) => serializer.serialize_str(&hash.to_string()),
            None => serializer.serialize_str(NIL),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Hash256>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == NIL {
            Ok(None)
        } else {
            Hash256::from_hex(&s).map(Some).map_err(serde::de::Error::custom)
        }
    }
}
