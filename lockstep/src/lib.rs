mod progress;

use serde::{Deserialize, Serialize};

/// An index of the validator in the sorted validator-id list, for a single
/// height. The lower layer keeps the mapping from actual node identities to
/// indices.
pub type ValidatorIndex = usize;
/// An identifier of a block, uniquely mapped to a block within a single
/// height. The lower layer keeps the mapping from actual block hashes to
/// identifiers.
pub type BlockIdentifier = usize;
/// The height this machine instance decides.
pub type Height = u64;
/// An attempt number within a height.
pub type Round = u32;
/// Virtual time in milliseconds.
pub type Timestamp = u64;

/// Timeouts for the three steps. The effective timeout of round `r` adds
/// `r * timeout_delta_ms` to the base, so stalled heights slow down rather
/// than spin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConsensusParams {
    pub timeout_propose_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_delta_ms: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            timeout_propose_ms: 3000,
            timeout_prevote_ms: 2000,
            timeout_precommit_ms: 2000,
            timeout_delta_ms: 0,
        }
    }
}

/// An immutable set of information that is used to perform the consensus
/// for a single height.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeightInfo {
    /// The number of validators. `ValidatorIndex` ranges over `0..count`.
    pub validator_count: usize,
    /// The index of this node; `None` for a non-validator observer.
    pub this_node_index: Option<ValidatorIndex>,
    /// The height being decided.
    pub height: Height,
    pub params: ConsensusParams,
}

/// An event that (potentially) triggers a state transition.
///
/// There is no cryptography-related info here; the lower layer verifies and
/// refines raw messages (signatures, duplicate proposals, vote counting)
/// before they reach the machine. Quorum detection in particular happens
/// below: the machine consumes quorum-level events, not individual votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// Signals to start round 0.
    Start { time: Timestamp },
    /// A valid, first-seen proposal for the given round has been received.
    BlockProposalReceived {
        proposal: BlockIdentifier,
        round: Round,
        time: Timestamp,
    },
    /// +2/3 of the validators prevoted for the given value (`None` = NIL).
    PrevoteQuorum {
        proposal: Option<BlockIdentifier>,
        round: Round,
        time: Timestamp,
    },
    /// +2/3 of the validators precommitted for the given value.
    PrecommitQuorum {
        proposal: Option<BlockIdentifier>,
        round: Round,
        time: Timestamp,
    },
    /// Informs that time has passed.
    Timer { time: Timestamp },
}

impl ConsensusEvent {
    fn time(&self) -> Timestamp {
        match self {
            ConsensusEvent::Start { time, .. } => *time,
            ConsensusEvent::BlockProposalReceived { time, .. } => *time,
            ConsensusEvent::PrevoteQuorum { time, .. } => *time,
            ConsensusEvent::PrecommitQuorum { time, .. } => *time,
            ConsensusEvent::Timer { time, .. } => *time,
        }
    }
}

/// A response that the machine might emit for a given event, which must be
/// carried out by the lower layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusResponse {
    /// Broadcast a proposal for the given round. `Some` re-proposes the
    /// locked block; `None` asks the caller to synthesize a fresh one.
    BroadcastProposal {
        proposal: Option<BlockIdentifier>,
        round: Round,
    },
    BroadcastPrevote {
        proposal: Option<BlockIdentifier>,
        round: Round,
    },
    BroadcastPrecommit {
        proposal: Option<BlockIdentifier>,
        round: Round,
    },
    /// The height is decided; the caller commits and retires this machine.
    FinalizeBlock {
        proposal: BlockIdentifier,
        round: Round,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConsensusStep {
    Initial,
    Propose,
    Prevote,
    Precommit,
}

/// A pending step timeout. It fires only while its step and round still
/// match the machine's; any transition makes it stale.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct PendingTimeout {
    pub step: ConsensusStep,
    pub round: Round,
    pub deadline: Timestamp,
}

/// The state of the consensus during a single height.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConsensusState {
    pub(crate) height_info: HeightInfo,
    pub(crate) round: Round,
    pub(crate) step: ConsensusStep,
    pub(crate) locked_value: Option<BlockIdentifier>,
    pub(crate) locked_round: Option<Round>,
    pub(crate) pending_timeout: Option<PendingTimeout>,
}

impl ConsensusState {
    /// Prepares the initial state of the consensus.
    pub fn new(height_info: HeightInfo) -> Self {
        ConsensusState {
            height_info,
            round: 0,
            step: ConsensusStep::Initial,
            locked_value: None,
            locked_round: None,
            pending_timeout: None,
        }
    }

    /// Makes a progress of the state machine with the given event.
    ///
    /// Events for a stale round or step are ignored and produce no
    /// responses; expired timeouts fire after the event is handled.
    pub fn progress(&mut self, event: ConsensusEvent) -> Vec<ConsensusResponse> {
        progress::progress(self, event)
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn step(&self) -> ConsensusStep {
        self.step
    }

    pub fn locked_value(&self) -> Option<BlockIdentifier> {
        self.locked_value
    }

    pub fn locked_round(&self) -> Option<Round> {
        self.locked_round
    }

    pub fn height_info(&self) -> &HeightInfo {
        &self.height_info
    }
}

/// The proposer of the given round: `(height + round) mod n`, an index into
/// the sorted validator-id list.
pub fn decide_proposer(height: Height, round: Round, validator_count: usize) -> ValidatorIndex {
    ((height + round as u64) % validator_count as u64) as usize
}
