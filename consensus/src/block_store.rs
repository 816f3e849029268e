use std::collections::HashMap;
use tendersim_common::{Block, Hash256, Height, Round};

/// Hash-keyed block storage with first-seen proposal tracking.
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: HashMap<Hash256, Block>,
    proposals: HashMap<(Height, Round), Hash256>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: Block) {
        self.blocks.insert(block.hash, block);
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// Records the proposal for `(height, round)`. Returns `false` when a
    /// different proposal was already seen there; the first one wins.
    pub fn record_proposal(&mut self, height: Height, round: Round, hash: Hash256) -> bool {
        match self.proposals.get(&(height, round)) {
            Some(existing) => *existing == hash,
            None => {
                self.proposals.insert((height, round), hash);
                true
            }
        }
    }

    pub fn proposal_at(&self, height: Height, round: Round) -> Option<Hash256> {
        self.proposals.get(&(height, round)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_proposal_wins() {
        let mut store = BlockStore::new();
        let first = Hash256::hash(b"first");
        let second = Hash256::hash(b"second");

        assert!(store.record_proposal(1, 0, first));
        assert!(!store.record_proposal(1, 0, second));
        // Re-recording the winner is fine.
        assert!(store.record_proposal(1, 0, first));
        assert_eq!(store.proposal_at(1, 0), Some(first));
        // Another round is unaffected.
        assert!(store.record_proposal(1, 1, second));
    }
}
