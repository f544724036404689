//! Hand saved transactions to a finalizer over a channel.
//!
//! [`TransactionSender`] is installed as the store's post-save hook and pushes
//! each saved transaction, as a JSON [`TransactionRef`], onto a bounded tokio
//! channel. A [`TransactionReceiver`] task drains the channel, reloads each
//! transaction and lets a [`TransactionChecker`] decide its fate. Committed
//! transactions can be forwarded to the sender of a further stage, so
//! checkers chain.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transact_types::TransactionRef;

use crate::error::{CoreError, CoreResult};
use crate::store::EventStore;
use crate::transaction::AnyTransaction;

/// Outcome chosen for a waiting transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Commit,
    Rollback,
}

/// Decides whether a saved transaction should be committed or discarded.
pub trait TransactionChecker: Send + Sync {
    fn check(&self, transaction: &dyn AnyTransaction) -> CoreResult<Verdict>;
}

impl<F> TransactionChecker for F
where
    F: Fn(&dyn AnyTransaction) -> CoreResult<Verdict> + Send + Sync,
{
    fn check(&self, transaction: &dyn AnyTransaction) -> CoreResult<Verdict> {
        self(transaction)
    }
}

/// Commits everything it is shown.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysCommit;

impl TransactionChecker for AlwaysCommit {
    fn check(&self, _transaction: &dyn AnyTransaction) -> CoreResult<Verdict> {
        Ok(Verdict::Commit)
    }
}

/// Ask `checker` for a verdict and apply it.
pub fn resolve(
    checker: &dyn TransactionChecker,
    transaction: &dyn AnyTransaction,
) -> CoreResult<Verdict> {
    let verdict = checker.check(transaction)?;
    match verdict {
        Verdict::Commit => transaction.commit()?,
        Verdict::Rollback => transaction.rollback()?,
    }
    Ok(verdict)
}

/// Pass a committed transaction on to the next stage, if there is one.
/// The commit stands whether or not the hand-off succeeds.
pub(crate) fn forward(downstream: Option<&TransactionSender>, transaction: &dyn AnyTransaction) {
    let Some(next) = downstream else {
        return;
    };
    if let Err(err) = next.send(transaction) {
        warn!(
            transaction = ?transaction.identity(),
            error = %err,
            "committed transaction not forwarded"
        );
    }
}

/// Producer half of the delivery channel.
#[derive(Clone, Debug)]
pub struct TransactionSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl TransactionSender {
    /// A sender and the receiving end of a channel holding at most
    /// `capacity` undelivered transactions.
    pub fn channel(capacity: usize) -> CoreResult<(Self, mpsc::Receiver<Vec<u8>>)> {
        if capacity == 0 {
            return Err(CoreError::Config("delivery capacity must be at least 1".into()));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok((Self { tx }, rx))
    }

    /// Queue a saved transaction without waiting for room.
    pub fn send(&self, transaction: &dyn AnyTransaction) -> CoreResult<()> {
        let bytes = transaction.to_ref()?.to_json()?;
        self.tx
            .try_send(bytes)
            .map_err(|e| CoreError::Delivery(e.to_string()))
    }

    /// Install this sender as `store`'s post-save hook.
    ///
    /// Delivery failures are logged; the save itself has already succeeded.
    pub fn install(self, store: &EventStore) {
        store.set_on_transaction_saved(move |transaction| {
            if let Err(err) = self.send(transaction) {
                warn!(
                    transaction = ?transaction.identity(),
                    error = %err,
                    "saved transaction not delivered"
                );
            }
        });
    }
}

/// Counts of what a receiver did before its channel closed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub committed: usize,
    pub rolled_back: usize,
    pub failed: usize,
}

/// Consumer half of the delivery channel.
pub struct TransactionReceiver {
    store: EventStore,
    checker: Arc<dyn TransactionChecker>,
    downstream: Option<TransactionSender>,
}

impl TransactionReceiver {
    pub fn new(store: EventStore, checker: Arc<dyn TransactionChecker>) -> Self {
        Self {
            store,
            checker,
            downstream: None,
        }
    }

    /// Send every transaction this receiver commits on to `next`.
    pub fn forward_to(mut self, next: TransactionSender) -> Self {
        self.downstream = Some(next);
        self
    }

    /// Drain `rx` on a tokio task until every sender is dropped.
    pub fn spawn(self, rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<DeliveryReport> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: mpsc::Receiver<Vec<u8>>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        while let Some(bytes) = rx.recv().await {
            let store = self.store.clone();
            let checker = Arc::clone(&self.checker);
            let downstream = self.downstream.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                handle(&store, checker.as_ref(), downstream.as_ref(), &bytes)
            })
                .await
                .map_err(|e| CoreError::Delivery(format!("finalizer task failed: {e}")))
                .and_then(|result| result);
            match outcome {
                Ok(Verdict::Commit) => report.committed += 1,
                Ok(Verdict::Rollback) => report.rolled_back += 1,
                Err(err) if err.is_race() => {
                    debug!(error = %err, "delivered transaction already finalized");
                    report.failed += 1;
                }
                Err(err) => {
                    error!(error = %err, "delivered transaction not finalized");
                    report.failed += 1;
                }
            }
        }
        info!(
            committed = report.committed,
            rolled_back = report.rolled_back,
            failed = report.failed,
            "delivery channel closed"
        );
        report
    }
}

fn handle(
    store: &EventStore,
    checker: &dyn TransactionChecker,
    downstream: Option<&TransactionSender>,
    bytes: &[u8],
) -> CoreResult<Verdict> {
    let wire = TransactionRef::from_json(bytes)?;
    let transaction = store.load_transaction(&wire.transaction_type_name, &wire.identity)?;
    let verdict = resolve(checker, transaction.as_ref())?;
    if verdict == Verdict::Commit {
        forward(downstream, transaction.as_ref());
    }
    debug!(transaction = %wire.identity, ?verdict, "delivered transaction finalized");
    Ok(verdict)
}
