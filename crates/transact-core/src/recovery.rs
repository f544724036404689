//! Background finalization of transactions left waiting after a save.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transact_types::Identity;

use crate::config::RecoveryConfig;
use crate::delivery::{forward, resolve, TransactionChecker, TransactionSender, Verdict};
use crate::error::{poisoned, CoreError, CoreResult};
use crate::store::EventStore;

/// What one poll did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub examined: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Lost races and transient failures, retried on the next poll.
    pub skipped: usize,
}

/// Polls the waiting list and hands each transaction to a checker.
///
/// Polls walk the waiting list in identity order, each one resuming after
/// the last transaction the previous poll examined and wrapping around at
/// the end, so transactions that keep failing cannot starve the rest.
pub struct RecoveryWorker {
    store: EventStore,
    checker: Arc<dyn TransactionChecker>,
    config: RecoveryConfig,
    downstream: Option<TransactionSender>,
    cursor: Mutex<Option<Identity>>,
}

impl RecoveryWorker {
    pub fn new(store: EventStore, checker: Arc<dyn TransactionChecker>, config: RecoveryConfig) -> Self {
        Self {
            store,
            checker,
            config,
            downstream: None,
            cursor: Mutex::new(None),
        }
    }

    /// Send every transaction this worker commits on to `next`.
    pub fn forward_to(mut self, next: TransactionSender) -> Self {
        self.downstream = Some(next);
        self
    }

    /// Run a single poll.
    ///
    /// Fails only on configuration errors, and only when the worker is
    /// configured to stop on them.
    pub fn run_once(&self) -> CoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut waiting = match self.store.waiting_transactions() {
            Ok(waiting) => waiting,
            Err(err) if self.fatal(&err) => return Err(err),
            Err(err) => {
                warn!(error = %err, "waiting transactions unavailable");
                return Ok(report);
            }
        };

        waiting.sort_by(|a, b| a.identity().cmp(b.identity()));
        let start = self
            .cursor
            .lock()
            .map_err(|_| poisoned("recovery cursor"))?
            .as_ref()
            .map_or(0, |last| {
                waiting.partition_point(|pending| pending.identity() <= last)
            });
        waiting.rotate_left(start);

        for pending in waiting.into_iter().take(self.config.max_per_poll) {
            report.examined += 1;
            *self.cursor.lock().map_err(|_| poisoned("recovery cursor"))? =
                Some(pending.identity().clone());
            let outcome = pending.load().and_then(|txn| {
                let verdict = resolve(self.checker.as_ref(), txn.as_ref())?;
                if verdict == Verdict::Commit {
                    forward(self.downstream.as_ref(), txn.as_ref());
                }
                Ok(verdict)
            });
            match outcome {
                Ok(Verdict::Commit) => report.committed += 1,
                Ok(Verdict::Rollback) => report.rolled_back += 1,
                Err(err) if self.fatal(&err) => {
                    error!(
                        transaction = %pending.identity(),
                        root_event = pending.root_event_name(),
                        error = %err,
                        "recovery stopped"
                    );
                    return Err(err);
                }
                Err(err) => {
                    debug!(
                        transaction = %pending.identity(),
                        error = %err,
                        "waiting transaction skipped"
                    );
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    fn fatal(&self, err: &CoreError) -> bool {
        self.config.stop_on_configuration_error && err.is_configuration()
    }

    /// Poll on a tokio interval until `shutdown` turns `true` or its sender
    /// is dropped. Backend calls run on the blocking pool.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<CoreResult<()>> {
        let period = self.config.poll_interval();
        let worker = Arc::new(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let poll = Arc::clone(&worker);
                        let report = tokio::task::spawn_blocking(move || poll.run_once())
                            .await
                            .map_err(|e| CoreError::InvalidState(format!("recovery poll failed: {e}")))??;
                        if report.examined > 0 {
                            info!(
                                examined = report.examined,
                                committed = report.committed,
                                rolled_back = report.rolled_back,
                                skipped = report.skipped,
                                "recovery poll"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("recovery worker stopped");
                            return Ok(());
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::testing::{TestEntity, TestEntityEvents, TestTransaction, TestTransactionEvents};
    use crate::transaction::AnyTransaction;
    use crate::delivery::AlwaysCommit;

    fn worker(store: &EventStore, checker: Arc<dyn TransactionChecker>) -> RecoveryWorker {
        RecoveryWorker::new(store.clone(), checker, RecoveryConfig::default())
    }

    #[test]
    fn waiting_entity_becomes_visible_after_recovery() {
        let store = EventStore::in_memory();
        let txn = store.start_transaction::<TestTransaction>("recover me").unwrap();
        let entity = txn.create_test_entity("TestName").unwrap();
        entity.make_operation1(456).unwrap();
        txn.save().unwrap();
        let id = entity.identity().unwrap();
        assert_eq!(store.waiting_transactions().unwrap().len(), 1);

        let poller = {
            let store = store.clone();
            let id = id.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let reader = store.start_transaction::<TestTransaction>("poll").unwrap();
                    if let Ok(found) = reader.get_entity::<TestEntity>(&id) {
                        return found.read(|e| e.testparametr).unwrap();
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                panic!("entity never became visible");
            })
        };

        thread::sleep(Duration::from_millis(20));
        let report = worker(&store, Arc::new(AlwaysCommit)).run_once().unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(poller.join().unwrap(), 456);
        assert!(store.waiting_transactions().unwrap().is_empty());
    }

    #[test]
    fn lost_races_are_skipped() {
        let store = EventStore::in_memory();
        store
            .start_transaction::<TestTransaction>("raced")
            .unwrap()
            .save()
            .unwrap();
        let sneaky = |txn: &dyn AnyTransaction| -> CoreResult<Verdict> {
            txn.commit()?;
            Ok(Verdict::Commit)
        };
        let report = worker(&store, Arc::new(sneaky)).run_once().unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                examined: 1,
                skipped: 1,
                ..RecoveryReport::default()
            }
        );
        assert!(store.waiting_transactions().unwrap().is_empty());
    }

    #[test]
    fn configuration_errors_stop_the_worker() {
        let store = EventStore::in_memory();
        store
            .start_transaction::<TestTransaction>("misconfigured")
            .unwrap()
            .save()
            .unwrap();
        let broken = |_: &dyn AnyTransaction| -> CoreResult<Verdict> {
            Err(CoreError::Config("checker has no rules".into()))
        };
        let checker: Arc<dyn TransactionChecker> = Arc::new(broken);
        assert!(matches!(
            worker(&store, Arc::clone(&checker)).run_once(),
            Err(CoreError::Config(_))
        ));

        let lenient = RecoveryWorker::new(
            store.clone(),
            checker,
            RecoveryConfig {
                stop_on_configuration_error: false,
                ..RecoveryConfig::default()
            },
        );
        assert_eq!(lenient.run_once().unwrap().skipped, 1);
    }

    #[test]
    fn per_poll_limit_is_honored() {
        let store = EventStore::in_memory();
        for i in 0..3 {
            store
                .start_transaction::<TestTransaction>(format!("batch {i}"))
                .unwrap()
                .save()
                .unwrap();
        }
        let limited = RecoveryWorker::new(
            store.clone(),
            Arc::new(AlwaysCommit),
            RecoveryConfig {
                max_per_poll: 2,
                ..RecoveryConfig::default()
            },
        );
        assert_eq!(limited.run_once().unwrap().committed, 2);
        assert_eq!(store.waiting_transactions().unwrap().len(), 1);
    }

    #[test]
    fn failing_head_does_not_starve_later_transactions() {
        let store = EventStore::in_memory();
        for name in ["stuck", "next", "last"] {
            store
                .start_transaction::<TestTransaction>(name)
                .unwrap()
                .save()
                .unwrap();
        }
        let refuse_stuck = |txn: &dyn AnyTransaction| -> CoreResult<Verdict> {
            if txn.description() == "stuck" {
                return Err(CoreError::InvalidState("checker unavailable".into()));
            }
            Ok(Verdict::Commit)
        };
        let worker = RecoveryWorker::new(
            store.clone(),
            Arc::new(refuse_stuck),
            RecoveryConfig {
                max_per_poll: 1,
                ..RecoveryConfig::default()
            },
        );

        assert_eq!(worker.run_once().unwrap().skipped, 1);
        assert_eq!(worker.run_once().unwrap().committed, 1);
        assert_eq!(worker.run_once().unwrap().committed, 1);
        assert_eq!(worker.run_once().unwrap().skipped, 1);

        let waiting = store.waiting_transactions().unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].load().unwrap().description(), "stuck");
    }

    #[tokio::test]
    async fn committed_transactions_are_forwarded() {
        let store = EventStore::in_memory();
        let kept = store.start_transaction::<TestTransaction>("keep").unwrap();
        kept.save().unwrap();
        store
            .start_transaction::<TestTransaction>("drop")
            .unwrap()
            .save()
            .unwrap();

        let (next, mut next_rx) = TransactionSender::channel(4).unwrap();
        let keep_only = |txn: &dyn AnyTransaction| -> CoreResult<Verdict> {
            Ok(if txn.description() == "keep" {
                Verdict::Commit
            } else {
                Verdict::Rollback
            })
        };
        let report = RecoveryWorker::new(store.clone(), Arc::new(keep_only), RecoveryConfig::default())
            .forward_to(next)
            .run_once()
            .unwrap();
        assert_eq!((report.committed, report.rolled_back), (1, 1));

        let bytes = next_rx.try_recv().unwrap();
        let forwarded = transact_types::TransactionRef::from_json(&bytes).unwrap();
        assert_eq!(forwarded.identity, kept.identity().unwrap());
        assert!(next_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn spawned_worker_drains_and_shuts_down() {
        let store = EventStore::in_memory();
        store
            .start_transaction::<TestTransaction>("background")
            .unwrap()
            .save()
            .unwrap();

        let (stop, shutdown) = watch::channel(false);
        let handle = RecoveryWorker::new(
            store.clone(),
            Arc::new(AlwaysCommit),
            RecoveryConfig {
                poll_interval_ms: 10,
                ..RecoveryConfig::default()
            },
        )
        .spawn(shutdown);

        for _ in 0..200 {
            if store.waiting_transactions().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.waiting_transactions().unwrap().is_empty());

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
