//! The per-validator consensus node: vote aggregation with exactly-once
//! quorum signaling, block storage with first-seen proposal semantics, the
//! append-only ledger, and the controller wiring the state machine to the
//! network.

mod block_store;
mod controller;
mod ledger;
mod tally;

pub use block_store::BlockStore;
pub use controller::Controller;
pub use ledger::Ledger;
pub use tally::{quorum_threshold, QuorumSignal, VoteTally};

use tendersim_common::{Hash256, Height};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("ledger parent mismatch at height {height}: expected {expected}, got {got}")]
    ParentMismatch {
        height: Height,
        expected: Hash256,
        got: Hash256,
    },
    #[error("non-contiguous ledger height: expected {expected}, got {got}")]
    NonContiguousHeight { expected: Height, got: Height },
}
