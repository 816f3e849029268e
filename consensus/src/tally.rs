use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tendersim_common::codec::encode_vote_for_signing;
use tendersim_common::{ChainId, Hash256, Height, NodeId, PublicKey, Round, SignedVote, Step};

/// The Byzantine-fault-tolerant threshold for `n` voters.
pub fn quorum_threshold(validator_count: usize) -> usize {
    validator_count * 2 / 3 + 1
}

/// Emitted exactly once per `(height, round, step, value)` when the
/// threshold is crossed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumSignal {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub block_hash: Option<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TallyKey {
    height: Height,
    round: Round,
    step: Step,
    block_hash: Option<Hash256>,
}

/// Counts authenticated votes per `(height, round, step, value)`.
///
/// Votes are retained across heights as evidence; replays are idempotent
/// and invalid or unknown signers change nothing.
pub struct VoteTally {
    chain_id: ChainId,
    validator_keys: BTreeMap<NodeId, PublicKey>,
    threshold: usize,
    votes: HashMap<TallyKey, BTreeSet<NodeId>>,
    signaled: HashSet<TallyKey>,
}

impl VoteTally {
    pub fn new(chain_id: ChainId, validator_keys: BTreeMap<NodeId, PublicKey>) -> Self {
        let threshold = quorum_threshold(validator_keys.len());
        VoteTally {
            chain_id,
            validator_keys,
            threshold,
            votes: HashMap::new(),
            signaled: HashSet::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Records an incoming vote, returning a quorum signal when the
    /// threshold is reached for the first time for that key.
    pub fn record(&mut self, signed: &SignedVote) -> Option<QuorumSignal> {
        let vote = &signed.vote;
        if vote.step == Step::Propose {
            debug!("dropping vote with invalid step from {}", vote.voter);
            return None;
        }
        let Some(public_key) = self.validator_keys.get(&vote.voter) else {
            debug!("dropping vote from unknown voter {}", vote.voter);
            return None;
        };
        let Ok(message) = encode_vote_for_signing(vote, &self.chain_id) else {
            return None;
        };
        if signed.signature.verify(&message, public_key).is_err() {
            debug!("dropping vote with invalid signature from {}", vote.voter);
            return None;
        }

        let key = TallyKey {
            height: vote.height,
            round: vote.round,
            step: vote.step,
            block_hash: vote.block_hash,
        };
        let voters = self.votes.entry(key.clone()).or_default();
        if !voters.insert(vote.voter.clone()) {
            return None;
        }
        if voters.len() == self.threshold && self.signaled.insert(key.clone()) {
            return Some(QuorumSignal {
                height: key.height,
                round: key.round,
                step: key.step,
                block_hash: key.block_hash,
            });
        }
        None
    }

    /// The number of distinct voters recorded for the given key.
    pub fn count(
        &self,
        height: Height,
        round: Round,
        step: Step,
        block_hash: Option<Hash256>,
    ) -> usize {
        self.votes
            .get(&TallyKey {
                height,
                round,
                step,
                block_hash,
            })
            .map_or(0, |voters| voters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendersim_common::{generate_keypair, PrivateKey, Signature, Vote};

    const CHAIN_ID: &str = "tally-test";

    fn setup(validator_count: usize) -> (VoteTally, Vec<(NodeId, PrivateKey)>) {
        let mut keys = BTreeMap::new();
        let mut signers = Vec::new();
        for i in 0..validator_count {
            let node_id = format!("node-{i}");
            let (public_key, private_key) = generate_keypair(&node_id);
            keys.insert(node_id.clone(), public_key);
            signers.push((node_id, private_key));
        }
        (VoteTally::new(CHAIN_ID.to_string(), keys), signers)
    }

    fn prevote(
        voter: &str,
        private_key: &PrivateKey,
        block_hash: Option<Hash256>,
    ) -> SignedVote {
        let vote = Vote {
            voter: voter.to_string(),
            height: 1,
            round: 0,
            step: Step::Prevote,
            block_hash,
        };
        let message = encode_vote_for_signing(&vote, &CHAIN_ID.to_string()).unwrap();
        SignedVote {
            signature: Signature::sign(message, private_key),
            vote,
        }
    }

    #[test]
    fn signals_exactly_once_at_the_threshold() {
        let (mut tally, signers) = setup(4);
        assert_eq!(tally.threshold(), 3);
        let hash = Some(Hash256::hash(b"block"));

        assert!(tally.record(&prevote("node-0", &signers[0].1, hash)).is_none());
        assert!(tally.record(&prevote("node-1", &signers[1].1, hash)).is_none());
        let signal = tally.record(&prevote("node-2", &signers[2].1, hash));
        assert_eq!(
            signal,
            Some(QuorumSignal {
                height: 1,
                round: 0,
                step: Step::Prevote,
                block_hash: hash,
            })
        );
        // The fourth vote for the same key must not signal again.
        assert!(tally.record(&prevote("node-3", &signers[3].1, hash)).is_none());
        assert_eq!(tally.count(1, 0, Step::Prevote, hash), 4);
    }

    #[test]
    fn replayed_votes_are_idempotent() {
        let (mut tally, signers) = setup(4);
        let hash = Some(Hash256::hash(b"block"));
        let vote = prevote("node-0", &signers[0].1, hash);
        assert!(tally.record(&vote).is_none());
        assert!(tally.record(&vote).is_none());
        assert_eq!(tally.count(1, 0, Step::Prevote, hash), 1);
    }

    /// One forged signature among three submissions leaves the tally below
    /// the threshold.
    #[test]
    fn invalid_signatures_do_not_count() {
        let (mut tally, signers) = setup(4);
        let hash = Some(Hash256::hash(b"block"));

        assert!(tally.record(&prevote("node-0", &signers[0].1, hash)).is_none());
        // node-1's vote signed with the wrong key.
        assert!(tally.record(&prevote("node-1", &signers[2].1, hash)).is_none());
        assert!(tally.record(&prevote("node-2", &signers[2].1, hash)).is_none());

        assert_eq!(tally.count(1, 0, Step::Prevote, hash), 2);
        assert_eq!(tally.threshold(), 3);
    }

    #[test]
    fn unknown_voters_are_dropped() {
        let (mut tally, _) = setup(4);
        let (_, stranger_key) = generate_keypair("stranger");
        assert!(tally
            .record(&prevote("stranger", &stranger_key, None))
            .is_none());
        assert_eq!(tally.count(1, 0, Step::Prevote, None), 0);
    }

    #[test]
    fn nil_votes_tally_separately() {
        let (mut tally, signers) = setup(4);
        let hash = Some(Hash256::hash(b"block"));
        tally.record(&prevote("node-0", &signers[0].1, hash));
        tally.record(&prevote("node-1", &signers[1].1, None));
        assert_eq!(tally.count(1, 0, Step::Prevote, hash), 1);
        assert_eq!(tally.count(1, 0, Step::Prevote, None), 1);
    }
}
