use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};
use transact_store::{InMemoryRepository, RepositoryContract};
use transact_types::Identity;

use crate::args::{Args, ObjectKey};
use crate::context::{ContextInner, PendingEvent};
use crate::entity::{Entity, EntityCell};
use crate::error::{poisoned, CoreError, CoreResult};
use crate::registry::{catalog_for, DESCRIPTION_PARAM};
use crate::transaction::{AnyTransaction, Transaction};
use crate::schema::TransactionType;

/// Callback run right after a transaction is saved.
pub type SaveHook = Arc<dyn Fn(&dyn AnyTransaction) + Send + Sync>;

type Loader = fn(&EventStore, &Identity) -> CoreResult<Box<dyn AnyTransaction>>;

fn load_boxed<X: TransactionType>(
    store: &EventStore,
    identity: &Identity,
) -> CoreResult<Box<dyn AnyTransaction>> {
    Ok(Box::new(store.get_transaction::<X>(identity)?))
}

pub(crate) struct StoreShared {
    pub(crate) repository: Arc<dyn RepositoryContract>,
    on_saved: RwLock<Option<SaveHook>>,
    /// Keyed by both type name and root event name.
    loaders: RwLock<HashMap<String, Loader>>,
}

impl StoreShared {
    pub(crate) fn notify_saved(&self, transaction: &dyn AnyTransaction) {
        let hook = self
            .on_saved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(transaction);
        }
    }
}

/// Entry point to the engine: starts and loads transactions against one
/// repository.
///
/// Cheap to clone; clones share the repository, the post-save hook, and the
/// set of registered transaction types.
#[derive(Clone)]
pub struct EventStore {
    shared: Arc<StoreShared>,
}

impl EventStore {
    pub fn new(repository: Arc<dyn RepositoryContract>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                repository,
                on_saved: RwLock::new(None),
                loaders: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// A store over a fresh [`InMemoryRepository`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRepository::new()))
    }

    pub fn repository(&self) -> &Arc<dyn RepositoryContract> {
        &self.shared.repository
    }

    /// Validate `X` and every entity type it can create, and make it
    /// loadable by name.
    pub fn register<X: TransactionType>(&self) -> CoreResult<()> {
        catalog_for::<X>()?;
        let mut loaders = self
            .shared
            .loaders
            .write()
            .map_err(|_| poisoned("loaders"))?;
        if !loaders.contains_key(X::TYPE_NAME) {
            loaders.insert(X::TYPE_NAME.to_string(), load_boxed::<X>);
            loaders.insert(X::ROOT_EVENT_NAME.to_string(), load_boxed::<X>);
            debug!(
                transaction_type = X::TYPE_NAME,
                root_event = X::ROOT_EVENT_NAME,
                "transaction type registered"
            );
        }
        Ok(())
    }

    /// Open a new transaction. Its root event, carrying `description`, is
    /// the first event of the batch.
    pub fn start_transaction<X: TransactionType>(
        &self,
        description: impl Into<String>,
    ) -> CoreResult<Transaction<X>> {
        self.register::<X>()?;
        let catalog = catalog_for::<X>()?;
        let description = description.into();
        let root = ObjectKey::next();
        let ctx = ContextInner::recording(
            Arc::clone(&self.shared),
            catalog,
            root,
            description.clone(),
        );
        let cell = EntityCell::recording(X::default());
        ctx.track(root, Arc::clone(&cell))?;
        ctx.push(PendingEvent {
            root,
            event_name: X::ROOT_EVENT_NAME.to_string(),
            args: Args::new().with(DESCRIPTION_PARAM, description),
        })?;
        Ok(Transaction::new(Entity::from_parts(root, cell, ctx)))
    }

    /// Load a saved transaction by identity, committed or not.
    ///
    /// The result is read-only: it can be committed or rolled back but not
    /// extended.
    pub fn get_transaction<X: TransactionType>(&self, identity: &Identity) -> CoreResult<Transaction<X>> {
        self.register::<X>()?;
        let catalog = catalog_for::<X>()?;
        let records = self.shared.repository.load_transaction_events(identity)?;
        let first = match records.first() {
            Some(first) if first.is_transaction_root() && &first.identity == identity => first,
            _ => return Err(CoreError::EntityNotFound(identity.clone())),
        };
        if first.event_name != catalog.root_event_name {
            return Err(CoreError::TransactionTypeMismatch {
                identity: identity.clone(),
                expected: catalog.root_event_name.to_string(),
                found: first.event_name.clone(),
            });
        }
        let description = first
            .params
            .get(DESCRIPTION_PARAM)
            .and_then(|v| v.as_text())
            .unwrap_or_default()
            .to_string();

        let ctx = ContextInner::loaded(
            Arc::clone(&self.shared),
            catalog,
            ObjectKey::next(),
            description,
        );
        let own: Vec<_> = records
            .iter()
            .filter(|record| &record.root == identity)
            .cloned()
            .collect();
        let cell = ctx.replay::<X>(&own)?;
        let root = ctx.install_root(identity, cell)?;
        debug!(
            transaction = %identity,
            transaction_type = X::TYPE_NAME,
            events = records.len(),
            "transaction loaded"
        );
        Ok(Transaction::new(root))
    }

    /// Load a transaction whose type is known only by name, either its type
    /// name or its root event name.
    pub fn load_transaction(
        &self,
        type_name: &str,
        identity: &Identity,
    ) -> CoreResult<Box<dyn AnyTransaction>> {
        let loader = self
            .shared
            .loaders
            .read()
            .map_err(|_| poisoned("loaders"))?
            .get(type_name)
            .copied()
            .ok_or_else(|| CoreError::UnknownTransactionType(type_name.to_string()))?;
        loader(self, identity)
    }

    /// Transactions saved but not yet committed or rolled back.
    pub fn waiting_transactions(&self) -> CoreResult<Vec<PendingTransaction>> {
        let markers = self.shared.repository.load_waiting_transactions()?;
        Ok(markers
            .into_iter()
            .map(|marker| PendingTransaction {
                identity: marker.identity,
                root_event_name: marker.root_event_name,
                store: self.clone(),
            })
            .collect())
    }

    /// Install the post-save hook, replacing any previous one.
    pub fn set_on_transaction_saved<F>(&self, hook: F)
    where
        F: Fn(&dyn AnyTransaction) + Send + Sync + 'static,
    {
        let mut slot = self
            .shared
            .on_saved
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("replacing existing post-save hook");
        }
        *slot = Some(Arc::new(hook));
    }

    pub fn clear_on_transaction_saved(&self) {
        *self
            .shared
            .on_saved
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

/// A transaction left waiting in the repository, loadable on demand.
#[derive(Clone)]
pub struct PendingTransaction {
    identity: Identity,
    root_event_name: String,
    store: EventStore,
}

impl PendingTransaction {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn root_event_name(&self) -> &str {
        &self.root_event_name
    }

    /// Load the transaction through the type registered for its root event.
    pub fn load(&self) -> CoreResult<Box<dyn AnyTransaction>> {
        self.store
            .load_transaction(&self.root_event_name, &self.identity)
    }
}

impl fmt::Debug for PendingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("identity", &self.identity)
            .field("root_event_name", &self.root_event_name)
            .finish()
    }
}
