use std::sync::atomic::{AtomicU64, Ordering};

use transact_types::Identity;

use crate::traits::IdentityGenerator;

/// Process-wide counter of sequence identities.
///
/// Each save reserves a contiguous block with a single atomic add, so
/// concurrent saves never interleave inside a block and every identity is
/// strictly greater than the ones reserved before it.
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// Create a counter whose first identity is `start`.
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Reserve `count` consecutive identities.
    pub fn reserve(&self, count: usize) -> BlockGenerator<'_> {
        let count = count as u64;
        let start = self.next.fetch_add(count, Ordering::SeqCst);
        BlockGenerator {
            source: self,
            cursor: AtomicU64::new(start),
            end: start + count,
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdentityGenerator for SequenceGenerator {
    fn next_identity(&self) -> Identity {
        Identity::from_sequence(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Generator over one reserved block.
///
/// Once the block is exhausted it falls back to single allocations from the
/// parent counter, which are always above every block reserved so far.
pub struct BlockGenerator<'a> {
    source: &'a SequenceGenerator,
    cursor: AtomicU64,
    end: u64,
}

impl BlockGenerator<'_> {
    /// Identities still available inside the reserved block.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.cursor.load(Ordering::SeqCst))
    }
}

impl IdentityGenerator for BlockGenerator<'_> {
    fn next_identity(&self) -> Identity {
        let seq = self.cursor.fetch_add(1, Ordering::SeqCst);
        if seq < self.end {
            Identity::from_sequence(seq)
        } else {
            self.source.next_identity()
        }
    }
}
