use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use transact_types::{EventRecord, Identity, WaitingTransactionMarker};

use crate::error::{StoreError, StoreResult};
use crate::sequence::SequenceGenerator;
use crate::traits::{check_batch, EventProducer, RepositoryContract};

/// In-memory repository for tests, local demos, and embedding.
///
/// Identities come from a process-local counter. Each save reserves its whole
/// block up front, so identities within a batch are consecutive and every
/// later batch sorts after it.
pub struct InMemoryRepository {
    sequence: SequenceGenerator,
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    events: Vec<StoredEvent>,
    /// Waiting markers keyed by transaction identity.
    waiting: BTreeMap<Identity, String>,
}

struct StoredEvent {
    record: EventRecord,
    committed: bool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            sequence: SequenceGenerator::default(),
            inner: RwLock::new(MemoryState::default()),
        }
    }

    /// Number of stored events, committed or not.
    pub fn event_count(&self) -> StoreResult<usize> {
        Ok(self.read()?.events.len())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("repository read"))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.inner
            .write()
            .map_err(|_| StoreError::LockPoisoned("repository write"))
    }

    fn collect_rooted<F>(&self, identity: &Identity, keep: F) -> StoreResult<Vec<EventRecord>>
    where
        F: Fn(&StoredEvent) -> bool,
    {
        let state = self.read()?;
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| &e.record.root == identity && keep(e))
            .map(|e| e.record.clone())
            .collect();
        events.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(events)
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryContract for InMemoryRepository {
    fn load_entity(&self, identity: &Identity) -> StoreResult<Vec<EventRecord>> {
        self.collect_rooted(identity, |e| e.committed)
    }

    fn load_transaction_events(&self, identity: &Identity) -> StoreResult<Vec<EventRecord>> {
        self.collect_rooted(identity, |_| true)
    }

    fn save_transaction(&self, count: usize, producer: EventProducer<'_>) -> StoreResult<()> {
        let block = self.sequence.reserve(count);
        let records = producer(&block)?;
        let transaction = check_batch(count, &records)?;
        let root_event_name = records[0].event_name.clone();

        let mut state = self.write()?;
        state
            .events
            .extend(records.into_iter().map(|record| StoredEvent {
                record,
                committed: false,
            }));
        state.waiting.insert(transaction.clone(), root_event_name);
        debug!(transaction = %transaction, count, "transaction saved");
        Ok(())
    }

    fn commit_transaction(&self, identity: &Identity) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.waiting.remove(identity).is_none() {
            return Err(StoreError::TransactionAlreadyCommitted(identity.clone()));
        }
        for event in state
            .events
            .iter_mut()
            .filter(|e| &e.record.transaction == identity)
        {
            event.committed = true;
        }
        debug!(transaction = %identity, "transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, identity: &Identity) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.waiting.remove(identity).is_none() {
            return Err(StoreError::TransactionAlreadyCommitted(identity.clone()));
        }
        let before = state.events.len();
        state.events.retain(|e| &e.record.transaction != identity);
        debug!(
            transaction = %identity,
            removed = before - state.events.len(),
            "transaction rolled back"
        );
        Ok(())
    }

    fn load_waiting_transactions(&self) -> StoreResult<Vec<WaitingTransactionMarker>> {
        let state = self.read()?;
        Ok(state
            .waiting
            .iter()
            .map(|(identity, name)| WaitingTransactionMarker {
                identity: identity.clone(),
                root_event_name: name.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::IdentityGenerator;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use transact_types::{Params, Value};

    /// Producer that stages one transaction root plus `children` entity
    /// creations, all rooted at their own identity.
    fn producer(children: usize) -> EventProducer<'static> {
        Box::new(move |gen: &dyn IdentityGenerator| {
            let txn = gen.next_identity();
            let mut out = vec![EventRecord {
                transaction: txn.clone(),
                identity: txn.clone(),
                root: txn.clone(),
                event_name: "TestTransaction".into(),
                params: Params::from([("description".into(), Value::from("test"))]),
            }];
            for _ in 0..children {
                let id = gen.next_identity();
                out.push(EventRecord {
                    transaction: txn.clone(),
                    identity: id.clone(),
                    root: id,
                    event_name: "CreateTestEntity".into(),
                    params: Params::new(),
                });
            }
            Ok(out)
        })
    }

    fn only_waiting(repo: &InMemoryRepository) -> Identity {
        let waiting = repo.load_waiting_transactions().unwrap();
        assert_eq!(waiting.len(), 1);
        waiting[0].identity.clone()
    }

    #[test]
    fn saved_events_are_invisible_until_commit() {
        let repo = InMemoryRepository::new();
        repo.save_transaction(2, producer(1)).unwrap();
        let txn = only_waiting(&repo);
        let entity = Identity::from_sequence(txn.sequence().unwrap() + 1);

        assert!(repo.load_entity(&entity).unwrap().is_empty());
        assert_eq!(repo.load_transaction_events(&txn).unwrap().len(), 1);

        repo.commit_transaction(&txn).unwrap();
        assert_eq!(repo.load_entity(&entity).unwrap().len(), 1);
        assert!(repo.load_waiting_transactions().unwrap().is_empty());
    }

    #[test]
    fn rollback_deletes_every_event() {
        let repo = InMemoryRepository::new();
        repo.save_transaction(3, producer(2)).unwrap();
        let txn = only_waiting(&repo);
        repo.rollback_transaction(&txn).unwrap();
        assert_eq!(repo.event_count().unwrap(), 0);
        assert!(repo.load_waiting_transactions().unwrap().is_empty());
    }

    #[test]
    fn second_finalization_fails() {
        let repo = InMemoryRepository::new();
        repo.save_transaction(1, producer(0)).unwrap();
        let txn = only_waiting(&repo);
        repo.commit_transaction(&txn).unwrap();
        assert_eq!(
            repo.commit_transaction(&txn).unwrap_err(),
            StoreError::TransactionAlreadyCommitted(txn.clone())
        );
        assert_eq!(
            repo.rollback_transaction(&txn).unwrap_err(),
            StoreError::TransactionAlreadyCommitted(txn)
        );
    }

    #[test]
    fn unknown_transaction_cannot_be_finalized() {
        let repo = InMemoryRepository::new();
        let missing = Identity::from_sequence(42);
        assert!(matches!(
            repo.commit_transaction(&missing),
            Err(StoreError::TransactionAlreadyCommitted(_))
        ));
    }

    #[test]
    fn producer_error_leaves_store_untouched() {
        let repo = InMemoryRepository::new();
        let failing: EventProducer<'_> =
            Box::new(|_: &dyn IdentityGenerator| Err(StoreError::ProducerAborted("unsupported".into())));
        assert!(matches!(
            repo.save_transaction(1, failing),
            Err(StoreError::ProducerAborted(_))
        ));
        assert_eq!(repo.event_count().unwrap(), 0);
        assert!(repo.load_waiting_transactions().unwrap().is_empty());
    }

    #[test]
    fn announced_count_is_enforced() {
        let repo = InMemoryRepository::new();
        assert!(matches!(
            repo.save_transaction(5, producer(1)),
            Err(StoreError::BatchSizeMismatch { expected: 5, produced: 2 })
        ));
        assert_eq!(repo.event_count().unwrap(), 0);
    }

    #[test]
    fn waiting_marker_carries_root_event_name() {
        let repo = InMemoryRepository::new();
        repo.save_transaction(1, producer(0)).unwrap();
        let waiting = repo.load_waiting_transactions().unwrap();
        assert_eq!(waiting[0].root_event_name, "TestTransaction");
    }

    #[test]
    fn concurrent_saves_get_disjoint_blocks() {
        let repo = Arc::new(InMemoryRepository::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || {
                    for _ in 0..10 {
                        repo.save_transaction(3, producer(2)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let waiting = repo.load_waiting_transactions().unwrap();
        assert_eq!(waiting.len(), 80);
        for marker in &waiting {
            let events = repo.load_transaction_events(&marker.identity).unwrap();
            assert_eq!(events.len(), 1);
            assert!(events[0].is_transaction_root());
        }
        assert_eq!(repo.event_count().unwrap(), 240);
    }

    proptest! {
        #[test]
        fn commit_exposes_exactly_the_saved_children(children in 0usize..12) {
            let repo = InMemoryRepository::new();
            repo.save_transaction(children + 1, producer(children)).unwrap();
            let txn = only_waiting(&repo);
            repo.commit_transaction(&txn).unwrap();

            let first = txn.sequence().unwrap();
            for offset in 1..=children as u64 {
                let events = repo.load_entity(&Identity::from_sequence(first + offset)).unwrap();
                prop_assert_eq!(events.len(), 1);
                prop_assert_eq!(&events[0].transaction, &txn);
            }
        }
    }
}
