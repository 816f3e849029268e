use crate::{BlockStore, Ledger, VoteTally};
use lockstep::{
    decide_proposer, BlockIdentifier, ConsensusEvent, ConsensusParams, ConsensusResponse,
    ConsensusState, HeightInfo,
};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tendersim_common::codec::encode_vote_for_signing;
use tendersim_common::{
    Block, ChainId, EnvelopeKind, Envelope, Hash256, Height, NodeId, Payload, PrivateKey,
    Proposal, PublicKey, Round, Signature, SignedVote, Step, Timestamp, Transaction, Vote,
};
use tendersim_execution::ExecutionState;
use tendersim_network::{EnvelopeHandler, OutboundEnvelope};

/// One validator's consensus node.
///
/// Owns the per-height state machine, the vote tally, the block store, the
/// ledger and the executor; refines raw envelopes into machine events and
/// turns machine responses back into signed broadcasts. All broadcasts go
/// to every validator including this node, so its own votes count toward
/// quorum through the same delivery path as everyone else's.
pub struct Controller {
    node_id: NodeId,
    chain_id: ChainId,
    private_key: PrivateKey,
    /// Validator ids in sorted order; proposer selection indexes this.
    validators: Vec<NodeId>,
    params: ConsensusParams,
    height: Height,
    machine: ConsensusState,
    tally: VoteTally,
    block_store: BlockStore,
    ledger: Ledger,
    execution: ExecutionState,
    /// Per-height mapping between block hashes and machine identifiers.
    known_blocks: Vec<Hash256>,
    block_ids: HashMap<Hash256, BlockIdentifier>,
}

impl Controller {
    pub fn new(
        node_id: NodeId,
        chain_id: ChainId,
        private_key: PrivateKey,
        validator_keys: BTreeMap<NodeId, PublicKey>,
        params: ConsensusParams,
    ) -> Self {
        let validators: Vec<NodeId> = validator_keys.keys().cloned().collect();
        let machine = ConsensusState::new(HeightInfo {
            validator_count: validators.len(),
            this_node_index: validators.iter().position(|id| *id == node_id),
            height: 1,
            params: params.clone(),
        });
        Controller {
            tally: VoteTally::new(chain_id.clone(), validator_keys),
            execution: ExecutionState::new(chain_id.clone()),
            node_id,
            chain_id,
            private_key,
            validators,
            params,
            height: 1,
            machine,
            block_store: BlockStore::new(),
            ledger: Ledger::new(),
            known_blocks: Vec::new(),
            block_ids: HashMap::new(),
        }
    }

    /// Starts round 0 of the first height.
    pub fn start(&mut self, now: Timestamp) -> Vec<OutboundEnvelope> {
        let responses = self.machine.progress(ConsensusEvent::Start { time: now });
        self.process_responses(responses, now)
    }

    /// Drives pending step timeouts against the virtual clock.
    pub fn poll(&mut self, now: Timestamp) -> Vec<OutboundEnvelope> {
        let responses = self.machine.progress(ConsensusEvent::Timer { time: now });
        self.process_responses(responses, now)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    // Inbound refinement -------------------------------------------------

    fn on_proposal(&mut self, proposal: Proposal, now: Timestamp) -> Vec<OutboundEnvelope> {
        if proposal.height != self.height {
            debug!(
                "{}: ignoring proposal for height {} (at {})",
                self.node_id, proposal.height, self.height
            );
            return Vec::new();
        }
        if proposal.block.height != proposal.height {
            debug!("{}: dropping proposal with inconsistent height", self.node_id);
            return Vec::new();
        }
        let computed = match proposal.block.compute_hash() {
            Ok(hash) => hash,
            Err(e) => {
                debug!("{}: dropping unhashable proposal: {e}", self.node_id);
                return Vec::new();
            }
        };
        if computed != proposal.block_hash || proposal.block.hash != proposal.block_hash {
            debug!("{}: dropping proposal with mismatched hash", self.node_id);
            return Vec::new();
        }
        let expected_proposer = &self.validators
            [decide_proposer(proposal.height, proposal.round, self.validators.len())];
        if proposal.block.proposer != *expected_proposer {
            debug!(
                "{}: dropping proposal from {} (expected {expected_proposer})",
                self.node_id, proposal.block.proposer
            );
            return Vec::new();
        }
        if !self
            .block_store
            .record_proposal(proposal.height, proposal.round, proposal.block_hash)
        {
            debug!(
                "{}: dropping conflicting proposal for round {}; first seen wins",
                self.node_id, proposal.round
            );
            return Vec::new();
        }
        self.block_store.insert(proposal.block.clone());
        let id = self.intern(proposal.block_hash);
        let responses = self.machine.progress(ConsensusEvent::BlockProposalReceived {
            proposal: id,
            round: proposal.round,
            time: now,
        });
        self.process_responses(responses, now)
    }

    fn on_vote(&mut self, signed: SignedVote, now: Timestamp) -> Vec<OutboundEnvelope> {
        let Some(signal) = self.tally.record(&signed) else {
            return Vec::new();
        };
        if signal.height != self.height {
            debug!(
                "{}: quorum for height {} while at {}",
                self.node_id, signal.height, self.height
            );
            return Vec::new();
        }
        let proposal = signal.block_hash.map(|hash| self.intern(hash));
        let event = match signal.step {
            Step::Prevote => ConsensusEvent::PrevoteQuorum {
                proposal,
                round: signal.round,
                time: now,
            },
            Step::Precommit => ConsensusEvent::PrecommitQuorum {
                proposal,
                round: signal.round,
                time: now,
            },
            Step::Propose => return Vec::new(),
        };
        let responses = self.machine.progress(event);
        self.process_responses(responses, now)
    }

    // Outbound processing ------------------------------------------------

    fn process_responses(
        &mut self,
        responses: Vec<ConsensusResponse>,
        now: Timestamp,
    ) -> Vec<OutboundEnvelope> {
        let mut outbound = Vec::new();
        let mut pending: VecDeque<ConsensusResponse> = responses.into();
        while let Some(response) = pending.pop_front() {
            match response {
                ConsensusResponse::BroadcastProposal { proposal, round } => {
                    let block = match proposal {
                        Some(id) => match self.block_by_id(id) {
                            Some(block) => block.clone(),
                            None => {
                                warn!("{}: locked block is not in the store", self.node_id);
                                continue;
                            }
                        },
                        None => self.synthesize_block(round),
                    };
                    let payload = Payload::Proposal(Proposal {
                        height: self.height,
                        round,
                        block_hash: block.hash,
                        block,
                    });
                    let header_id =
                        format!("proposal-{}-{}-{}", self.height, round, self.node_id);
                    outbound.extend(self.broadcast(header_id, payload));
                }
                ConsensusResponse::BroadcastPrevote { proposal, round } => {
                    outbound.extend(self.broadcast_vote(Step::Prevote, proposal, round));
                }
                ConsensusResponse::BroadcastPrecommit { proposal, round } => {
                    outbound.extend(self.broadcast_vote(Step::Precommit, proposal, round));
                }
                ConsensusResponse::FinalizeBlock { proposal, round } => {
                    pending.extend(self.commit(proposal, round, now));
                }
            }
        }
        outbound
    }

    /// Commits the decided block: execute, append to the ledger, move to
    /// the next height. Returns the new height's start responses.
    fn commit(
        &mut self,
        proposal: BlockIdentifier,
        round: Round,
        now: Timestamp,
    ) -> Vec<ConsensusResponse> {
        let Some(block_hash) = self.known_blocks.get(proposal).copied() else {
            warn!("{}: decided an unknown block identifier", self.node_id);
            return Vec::new();
        };
        let Some(block) = self.block_store.get(&block_hash).cloned() else {
            warn!(
                "{}: decided block {block_hash} is not in the store",
                self.node_id
            );
            return Vec::new();
        };
        let state_root = match self.execution.apply_block(&block, false) {
            Ok(root) => root,
            Err(e) => {
                warn!("{}: refusing to commit {block_hash}: {e}", self.node_id);
                return Vec::new();
            }
        };
        let entry = tendersim_common::LedgerEntry {
            height: self.height,
            parent_hash: block.parent_hash,
            state_root,
            proposer: block.proposer.clone(),
            block_hash,
        };
        if let Err(e) = self.ledger.append(entry) {
            warn!("{}: refusing to commit {block_hash}: {e}", self.node_id);
            return Vec::new();
        }
        debug!(
            "{}: committed {block_hash} at height {} round {round}",
            self.node_id, self.height
        );

        self.height += 1;
        self.known_blocks.clear();
        self.block_ids.clear();
        self.machine = ConsensusState::new(HeightInfo {
            validator_count: self.validators.len(),
            this_node_index: self.validators.iter().position(|id| *id == self.node_id),
            height: self.height,
            params: self.params.clone(),
        });
        self.machine.progress(ConsensusEvent::Start { time: now })
    }

    fn synthesize_block(&mut self, round: Round) -> Block {
        let height = self.height;
        let mut block = Block {
            height,
            round,
            parent_hash: self.ledger.last_hash(),
            proposer: self.node_id.clone(),
            txs: vec![Transaction {
                sender: format!("user-{height}"),
                key: format!("user-{height}/message"),
                value: serde_json::json!(format!("hello-{height}")),
                nonce: 1,
                signature: None,
            }],
            hash: Hash256::zero(),
        };
        block.hash = block.compute_hash().unwrap();
        self.block_store.insert(block.clone());
        block
    }

    fn broadcast_vote(
        &mut self,
        step: Step,
        proposal: Option<BlockIdentifier>,
        round: Round,
    ) -> Vec<OutboundEnvelope> {
        let block_hash = match proposal {
            Some(id) => match self.known_blocks.get(id).copied() {
                Some(hash) => Some(hash),
                None => {
                    warn!("{}: vote target is not a known block", self.node_id);
                    return Vec::new();
                }
            },
            None => None,
        };
        let vote = Vote {
            voter: self.node_id.clone(),
            height: self.height,
            round,
            step,
            block_hash,
        };
        let message = match encode_vote_for_signing(&vote, &self.chain_id) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: failed to encode vote: {e}", self.node_id);
                return Vec::new();
            }
        };
        let signature = Signature::sign(message, &self.private_key);
        let header_id = format!("vote-{step}-{}-{round}-{}", self.height, self.node_id);
        self.broadcast(header_id, Payload::Vote(SignedVote { vote, signature }))
    }

    /// Builds one header per validator, this node included.
    fn broadcast(&self, base_header_id: String, payload: Payload) -> Vec<OutboundEnvelope> {
        self.validators
            .iter()
            .map(|peer| OutboundEnvelope {
                kind: EnvelopeKind::Header,
                receiver: peer.clone(),
                header_id: format!("{base_header_id}-{peer}"),
                height: self.height,
                payload: payload.clone(),
            })
            .collect()
    }

    fn intern(&mut self, hash: Hash256) -> BlockIdentifier {
        if let Some(id) = self.block_ids.get(&hash) {
            return *id;
        }
        let id = self.known_blocks.len();
        self.known_blocks.push(hash);
        self.block_ids.insert(hash, id);
        id
    }

    fn block_by_id(&self, id: BlockIdentifier) -> Option<&Block> {
        self.known_blocks
            .get(id)
            .and_then(|hash| self.block_store.get(hash))
    }
}

impl EnvelopeHandler for Controller {
    fn on_envelope(&mut self, envelope: Envelope, now: Timestamp) -> Vec<OutboundEnvelope> {
        match envelope.payload {
            Payload::Proposal(proposal) => self.on_proposal(proposal, now),
            Payload::Vote(signed) => self.on_vote(signed, now),
        }
    }
}
