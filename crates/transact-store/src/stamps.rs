use std::sync::{Mutex, PoisonError};

use transact_types::{ClockStamp, Identity};

use crate::traits::IdentityGenerator;

/// Issues the write stamps and identities of a [`QuorumRepository`].
///
/// Each stamp is the later of the wall clock and the successor of the last
/// stamp issued or observed, so stamps from one allocator strictly increase
/// even when the wall clock stalls or steps back. Observing the stamps read
/// back from replicas keeps later writes ordered after them.
///
/// [`QuorumRepository`]: crate::QuorumRepository
pub struct StampAllocator {
    node_id: u16,
    last: Mutex<ClockStamp>,
}

impl StampAllocator {
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id,
            last: Mutex::new(ClockStamp::zero()),
        }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn next_stamp(&self) -> ClockStamp {
        let wall = ClockStamp::now(self.node_id);
        // A single copyable value; a poisoned guard still holds a valid stamp.
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let successor = last.successor(self.node_id);
        let stamp = if wall > successor { wall } else { successor };
        *last = stamp;
        stamp
    }

    /// Never issue a stamp at or below `seen` from now on.
    pub fn observe(&self, seen: ClockStamp) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if seen > *last {
            *last = seen;
        }
    }
}

impl IdentityGenerator for StampAllocator {
    fn next_identity(&self) -> Identity {
        self.next_stamp().to_identity()
    }
}
