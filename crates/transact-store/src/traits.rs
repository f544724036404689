use transact_types::{EventRecord, Identity, WaitingTransactionMarker};

use crate::error::{StoreError, StoreResult};

/// Source of fresh identities handed to a save producer.
///
/// Implementations must yield values that are unique and strictly
/// increasing for the lifetime of every root they are used for, including
/// under concurrent allocation.
pub trait IdentityGenerator: Send + Sync {
    fn next_identity(&self) -> Identity;
}

/// Callback that converts a staged batch into identity-stamped records.
///
/// Invoked exactly once by [`RepositoryContract::save_transaction`] with the
/// backend's generator. Errors returned by the producer abort the save and
/// are passed back to the caller unchanged.
pub type EventProducer<'a> =
    Box<dyn FnOnce(&dyn IdentityGenerator) -> StoreResult<Vec<EventRecord>> + 'a>;

/// Storage boundary of the transactional engine.
///
/// All implementations must satisfy these invariants:
/// - Events of a saved transaction stay invisible to [`load_entity`] until
///   the transaction is committed, and are deleted entirely on rollback.
/// - Events sharing a root are returned in ascending identity order.
/// - A waiting marker exists for every saved transaction from save until
///   commit or rollback.
/// - Once `commit_transaction` returns, every subsequent read observes it.
///
/// [`load_entity`]: RepositoryContract::load_entity
pub trait RepositoryContract: Send + Sync {
    /// Committed events rooted at `identity`, in ascending identity order.
    ///
    /// Returns an empty vector if none exist or none are committed.
    fn load_entity(&self, identity: &Identity) -> StoreResult<Vec<EventRecord>>;

    /// All events rooted at the transaction `identity`, committed or not,
    /// in ascending identity order.
    fn load_transaction_events(&self, identity: &Identity) -> StoreResult<Vec<EventRecord>>;

    /// Persist a batch as pending and record a waiting marker for it.
    ///
    /// `count` is the number of events the producer will yield; backends
    /// may use it to reserve identities up front.
    fn save_transaction(&self, count: usize, producer: EventProducer<'_>) -> StoreResult<()>;

    /// Make every event of the transaction visible and drop its marker.
    ///
    /// Fails with [`StoreError::TransactionAlreadyCommitted`] if the
    /// transaction is already finalized or does not exist.
    fn commit_transaction(&self, identity: &Identity) -> StoreResult<()>;

    /// Delete every event of the transaction and drop its marker.
    ///
    /// Fails with [`StoreError::TransactionAlreadyCommitted`] if the
    /// transaction is already finalized or does not exist.
    fn rollback_transaction(&self, identity: &Identity) -> StoreResult<()>;

    /// Markers of transactions saved but not yet finalized, ascending by
    /// identity.
    fn load_waiting_transactions(&self) -> StoreResult<Vec<WaitingTransactionMarker>>;
}

/// Validate a produced batch before it is written.
///
/// The first record must open the transaction (identity, root, and
/// transaction all equal), every record must carry that transaction id, and
/// the batch must contain exactly `expected` records.
pub fn check_batch(expected: usize, records: &[EventRecord]) -> StoreResult<Identity> {
    if records.len() != expected {
        return Err(StoreError::BatchSizeMismatch {
            expected,
            produced: records.len(),
        });
    }
    let first = records
        .first()
        .ok_or_else(|| StoreError::MalformedBatch("batch is empty".into()))?;
    if !first.is_transaction_root() {
        return Err(StoreError::MalformedBatch(format!(
            "first event {} does not open its transaction",
            first.identity
        )));
    }
    if let Some(stray) = records.iter().find(|r| r.transaction != first.transaction) {
        return Err(StoreError::MalformedBatch(format!(
            "event {} belongs to transaction {}, expected {}",
            stray.identity, stray.transaction, first.transaction
        )));
    }
    Ok(first.transaction.clone())
}
