use crate::ConsensusError;
use tendersim_common::{Hash256, Height, LedgerEntry};

/// The in-memory append-only ledger of finalized headers.
///
/// Heights are strictly `1, 2, 3, ...` and every entry's parent hash must
/// equal the previous entry's block hash; violating either is a safety
/// fault surfaced to the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> Height {
        self.entries.len() as Height
    }

    /// The hash the next block must extend; the zero hash for an empty
    /// ledger.
    pub fn last_hash(&self) -> Hash256 {
        self.entries
            .last()
            .map(|entry| entry.block_hash)
            .unwrap_or_else(Hash256::zero)
    }

    pub fn append(&mut self, entry: LedgerEntry) -> Result<(), ConsensusError> {
        let expected_height = self.height() + 1;
        if entry.height != expected_height {
            return Err(ConsensusError::NonContiguousHeight {
                expected: expected_height,
                got: entry.height,
            });
        }
        let expected_parent = self.last_hash();
        if entry.parent_hash != expected_parent {
            return Err(ConsensusError::ParentMismatch {
                height: entry.height,
                expected: expected_parent,
                got: entry.parent_hash,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get(&self, height: Height) -> Option<&LedgerEntry> {
        height
            .checked_sub(1)
            .and_then(|index| self.entries.get(index as usize))
    }
}
