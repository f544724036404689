use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use transact_types::{ClockStamp, EventRecord, Identity, WaitingTransactionMarker};

use crate::stamps::StampAllocator;
use crate::error::{StoreError, StoreResult};
use crate::traits::{check_batch, EventProducer, RepositoryContract};

/// Configuration for [`QuorumRepository`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Number of replicas in the set. Reads and writes need a majority.
    pub replicas: usize,
    /// Node id stamped into clock identities issued by this process.
    pub node_id: u16,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            node_id: 0,
        }
    }
}

impl QuorumConfig {
    /// Majority size for the configured replica count.
    pub fn quorum(&self) -> usize {
        self.replicas / 2 + 1
    }
}

/// A replicated value with its write stamp. `None` is a tombstone.
#[derive(Clone, Debug)]
struct Cell<T> {
    written_at: ClockStamp,
    value: Option<T>,
}

#[derive(Clone, Debug)]
struct TransactionRow {
    root_event_name: String,
    committed: bool,
    /// `(root, identity)` keys of every event in the batch.
    events: Vec<(Identity, Identity)>,
}

#[derive(Default)]
struct ReplicaTables {
    events: BTreeMap<(Identity, Identity), Cell<EventRecord>>,
    transactions: BTreeMap<Identity, Cell<TransactionRow>>,
    /// `(root, transaction)` pairs whose transaction has been committed.
    committed: BTreeMap<(Identity, Identity), Cell<()>>,
}

struct Replica {
    online: AtomicBool,
    tables: RwLock<ReplicaTables>,
}

enum Mutation {
    PutEvent(EventRecord),
    DeleteEvent { root: Identity, identity: Identity },
    PutTransaction(Identity, TransactionRow),
    DeleteTransaction(Identity),
    PutCommitted { root: Identity, transaction: Identity },
}

/// Last-write-wins insert; older stamps never overwrite newer ones.
fn upsert<K: Ord, V>(table: &mut BTreeMap<K, Cell<V>>, key: K, cell: Cell<V>) {
    match table.get(&key) {
        Some(existing) if existing.written_at >= cell.written_at => {}
        _ => {
            table.insert(key, cell);
        }
    }
}

/// Merge replica snapshots by keeping the newest cell per key.
fn merge<K: Ord, V>(snapshots: impl IntoIterator<Item = Vec<(K, Cell<V>)>>) -> BTreeMap<K, Cell<V>> {
    let mut merged = BTreeMap::new();
    for snapshot in snapshots {
        for (key, cell) in snapshot {
            upsert(&mut merged, key, cell);
        }
    }
    merged
}

impl ReplicaTables {
    fn apply(&mut self, stamp: ClockStamp, mutation: &Mutation) {
        match mutation {
            Mutation::PutEvent(record) => upsert(
                &mut self.events,
                (record.root.clone(), record.identity.clone()),
                Cell {
                    written_at: stamp,
                    value: Some(record.clone()),
                },
            ),
            Mutation::DeleteEvent { root, identity } => upsert(
                &mut self.events,
                (root.clone(), identity.clone()),
                Cell {
                    written_at: stamp,
                    value: None,
                },
            ),
            Mutation::PutTransaction(identity, row) => upsert(
                &mut self.transactions,
                identity.clone(),
                Cell {
                    written_at: stamp,
                    value: Some(row.clone()),
                },
            ),
            Mutation::DeleteTransaction(identity) => upsert(
                &mut self.transactions,
                identity.clone(),
                Cell {
                    written_at: stamp,
                    value: None,
                },
            ),
            Mutation::PutCommitted { root, transaction } => upsert(
                &mut self.committed,
                (root.clone(), transaction.clone()),
                Cell {
                    written_at: stamp,
                    value: Some(()),
                },
            ),
        }
    }
}

/// Replicated repository with majority reads and writes.
///
/// Every write is stamped by a [`StampAllocator`] and applied to all
/// reachable replicas; it fails unless a majority is reachable. Reads gather
/// a majority and merge cells last-write-wins, so any read overlaps every
/// acknowledged write in at least one replica. Event and transaction
/// identities are stamps from the same allocator, ordered by physical
/// time, then logical counter, then node id.
///
/// Commit and rollback are serialized per process so that a transaction
/// cannot be finalized twice from the same repository handle.
pub struct QuorumRepository {
    stamps: StampAllocator,
    replicas: Vec<Replica>,
    quorum: usize,
    finalize_lock: Mutex<()>,
}

impl QuorumRepository {
    pub fn new(config: QuorumConfig) -> StoreResult<Self> {
        if config.replicas == 0 {
            return Err(StoreError::InvalidConfig(
                "replica set must contain at least one replica".into(),
            ));
        }
        let replicas = (0..config.replicas)
            .map(|_| Replica {
                online: AtomicBool::new(true),
                tables: RwLock::new(ReplicaTables::default()),
            })
            .collect();
        Ok(Self {
            stamps: StampAllocator::new(config.node_id),
            replicas,
            quorum: config.quorum(),
            finalize_lock: Mutex::new(()),
        })
    }

    /// Mark a replica reachable or unreachable. Returns `false` if no
    /// replica has that index.
    pub fn set_online(&self, replica: usize, online: bool) -> bool {
        match self.replicas.get(replica) {
            Some(r) => {
                r.online.store(online, Ordering::SeqCst);
                debug!(replica, online, "replica availability changed");
                true
            }
            None => false,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    fn online(&self) -> StoreResult<Vec<&Replica>> {
        let online: Vec<&Replica> = self
            .replicas
            .iter()
            .filter(|r| r.online.load(Ordering::SeqCst))
            .collect();
        if online.len() < self.quorum {
            warn!(
                required = self.quorum,
                reached = online.len(),
                "quorum unavailable"
            );
            return Err(StoreError::QuorumUnavailable {
                required: self.quorum,
                reached: online.len(),
            });
        }
        Ok(online)
    }

    fn write_batch(&self, mutations: &[Mutation]) -> StoreResult<()> {
        let targets = self.online()?;
        let stamp = self.stamps.next_stamp();
        for replica in targets {
            let mut tables = replica
                .tables
                .write()
                .map_err(|_| StoreError::LockPoisoned("replica write"))?;
            for mutation in mutations {
                tables.apply(stamp, mutation);
            }
        }
        Ok(())
    }

    fn read_events(&self, root: &Identity) -> StoreResult<Vec<EventRecord>> {
        let mut snapshots = Vec::new();
        for replica in self.online()? {
            let tables = replica
                .tables
                .read()
                .map_err(|_| StoreError::LockPoisoned("replica read"))?;
            snapshots.push(
                tables
                    .events
                    .iter()
                    .filter(|((r, _), _)| r == root)
                    .map(|(k, c)| (k.clone(), c.clone()))
                    .collect::<Vec<_>>(),
            );
        }
        // Keys are (root, identity), so merged values come out in identity order.
        Ok(self.merged(snapshots)
            .into_values()
            .filter_map(|cell| cell.value)
            .collect())
    }

    fn read_committed(&self, root: &Identity) -> StoreResult<BTreeSet<Identity>> {
        let mut snapshots = Vec::new();
        for replica in self.online()? {
            let tables = replica
                .tables
                .read()
                .map_err(|_| StoreError::LockPoisoned("replica read"))?;
            snapshots.push(
                tables
                    .committed
                    .iter()
                    .filter(|((r, _), _)| r == root)
                    .map(|(k, c)| (k.clone(), c.clone()))
                    .collect::<Vec<_>>(),
            );
        }
        Ok(self.merged(snapshots)
            .into_iter()
            .filter(|(_, cell)| cell.value.is_some())
            .map(|((_, transaction), _)| transaction)
            .collect())
    }

    fn read_transactions(&self) -> StoreResult<BTreeMap<Identity, TransactionRow>> {
        let mut snapshots = Vec::new();
        for replica in self.online()? {
            let tables = replica
                .tables
                .read()
                .map_err(|_| StoreError::LockPoisoned("replica read"))?;
            snapshots.push(
                tables
                    .transactions
                    .iter()
                    .map(|(k, c)| (k.clone(), c.clone()))
                    .collect::<Vec<_>>(),
            );
        }
        Ok(self.merged(snapshots)
            .into_iter()
            .filter_map(|(k, cell)| cell.value.map(|row| (k, row)))
            .collect())
    }

    /// Merge replica snapshots and move the allocator past every stamp read.
    fn merged<K: Ord, V>(
        &self,
        snapshots: impl IntoIterator<Item = Vec<(K, Cell<V>)>>,
    ) -> BTreeMap<K, Cell<V>> {
        let merged = merge(snapshots);
        if let Some(newest) = merged.values().map(|cell| cell.written_at).max() {
            self.stamps.observe(newest);
        }
        merged
    }

    /// Load a transaction row that is still waiting, or fail as already
    /// finalized.
    fn load_pending(&self, identity: &Identity) -> StoreResult<TransactionRow> {
        match self.read_transactions()?.remove(identity) {
            Some(row) if !row.committed => Ok(row),
            _ => Err(StoreError::TransactionAlreadyCommitted(identity.clone())),
        }
    }
}

impl RepositoryContract for QuorumRepository {
    fn load_entity(&self, identity: &Identity) -> StoreResult<Vec<EventRecord>> {
        let committed = self.read_committed(identity)?;
        if committed.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .read_events(identity)?
            .into_iter()
            .filter(|e| committed.contains(&e.transaction))
            .collect())
    }

    fn load_transaction_events(&self, identity: &Identity) -> StoreResult<Vec<EventRecord>> {
        self.read_events(identity)
    }

    fn save_transaction(&self, count: usize, producer: EventProducer<'_>) -> StoreResult<()> {
        let records = producer(&self.stamps)?;
        let transaction = check_batch(count, &records)?;

        let row = TransactionRow {
            root_event_name: records[0].event_name.clone(),
            committed: false,
            events: records
                .iter()
                .map(|r| (r.root.clone(), r.identity.clone()))
                .collect(),
        };
        let mut mutations: Vec<Mutation> = records.into_iter().map(Mutation::PutEvent).collect();
        mutations.push(Mutation::PutTransaction(transaction.clone(), row));

        self.write_batch(&mutations)?;
        debug!(transaction = %transaction, count, "transaction saved to quorum");
        Ok(())
    }

    fn commit_transaction(&self, identity: &Identity) -> StoreResult<()> {
        let _guard = self
            .finalize_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned("finalize"))?;
        let mut row = self.load_pending(identity)?;

        let roots: BTreeSet<Identity> = row.events.iter().map(|(root, _)| root.clone()).collect();
        let mut mutations: Vec<Mutation> = roots
            .into_iter()
            .map(|root| Mutation::PutCommitted {
                root,
                transaction: identity.clone(),
            })
            .collect();
        row.committed = true;
        mutations.push(Mutation::PutTransaction(identity.clone(), row));

        self.write_batch(&mutations)?;
        debug!(transaction = %identity, "transaction committed to quorum");
        Ok(())
    }

    fn rollback_transaction(&self, identity: &Identity) -> StoreResult<()> {
        let _guard = self
            .finalize_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned("finalize"))?;
        let row = self.load_pending(identity)?;

        let mut mutations: Vec<Mutation> = row
            .events
            .into_iter()
            .map(|(root, identity)| Mutation::DeleteEvent { root, identity })
            .collect();
        mutations.push(Mutation::DeleteTransaction(identity.clone()));

        self.write_batch(&mutations)?;
        debug!(transaction = %identity, "transaction rolled back from quorum");
        Ok(())
    }

    fn load_waiting_transactions(&self) -> StoreResult<Vec<WaitingTransactionMarker>> {
        Ok(self
            .read_transactions()?
            .into_iter()
            .filter(|(_, row)| !row.committed)
            .map(|(identity, row)| WaitingTransactionMarker {
                identity,
                root_event_name: row.root_event_name,
            })
            .collect())
    }
}
