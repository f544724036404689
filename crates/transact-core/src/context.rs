use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use tracing::{debug, info, warn};
use transact_store::{EventProducer, IdentityGenerator, StoreError};
use transact_types::{EventRecord, Identity};

use crate::args::{Args, EventArgs, ObjectKey};
use crate::entity::{Entity, EntityCell, Mode};
use crate::error::{poisoned, CoreError, CoreResult};
use crate::registry::{schema_of, Catalog};
use crate::resolver;
use crate::schema::{check_args, Aggregate, EventKey};
use crate::store::StoreShared;

/// One recorded call, before identities are assigned.
#[derive(Clone, Debug)]
pub(crate) struct PendingEvent {
    pub(crate) root: ObjectKey,
    pub(crate) event_name: String,
    pub(crate) args: Args,
}

struct ObjectSlot {
    type_name: &'static str,
    /// An `EntityCell<T>` of the named type.
    cell: Arc<dyn Any + Send + Sync>,
}

/// State of one transaction: its event queue and the identity side tables
/// of every object it tracks.
///
/// The queue is `None` once the transaction is saved or if it was loaded
/// from storage; recording then fails with `TransactionReadOnly`.
///
/// Recording holds the shared side of `recording` from the read-only check
/// until the event is queued, and `save` closes the queue under the
/// exclusive side. An apply function therefore never runs against a
/// transaction that is saved before its event lands in the queue.
pub(crate) struct ContextInner {
    pub(crate) shared: Arc<StoreShared>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) root: ObjectKey,
    description: String,
    recording: RwLock<()>,
    queue: Mutex<Option<Vec<PendingEvent>>>,
    objects: RwLock<HashMap<ObjectKey, ObjectSlot>>,
    identities: RwLock<HashMap<ObjectKey, Identity>>,
    entities: RwLock<HashMap<Identity, ObjectKey>>,
}

// Lock order: recording, entity cells, then the maps (entities, objects,
// identities). The queue mutex is a leaf and is never held across user code.

impl ContextInner {
    fn new(
        shared: Arc<StoreShared>,
        catalog: Arc<Catalog>,
        root: ObjectKey,
        description: String,
        queue: Option<Vec<PendingEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared,
            catalog,
            root,
            description,
            recording: RwLock::new(()),
            queue: Mutex::new(queue),
            objects: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
            entities: RwLock::new(HashMap::new()),
        })
    }

    /// A fresh context accepting events.
    pub(crate) fn recording(
        shared: Arc<StoreShared>,
        catalog: Arc<Catalog>,
        root: ObjectKey,
        description: String,
    ) -> Arc<Self> {
        Self::new(shared, catalog, root, description, Some(Vec::new()))
    }

    /// A read-only context for a transaction loaded from storage.
    pub(crate) fn loaded(
        shared: Arc<StoreShared>,
        catalog: Arc<Catalog>,
        root: ObjectKey,
        description: String,
    ) -> Arc<Self> {
        Self::new(shared, catalog, root, description, None)
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn is_read_only(&self) -> CoreResult<bool> {
        Ok(self.queue.lock().map_err(|_| poisoned("queue"))?.is_none())
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> CoreResult<usize> {
        Ok(self
            .queue
            .lock()
            .map_err(|_| poisoned("queue"))?
            .as_ref()
            .map_or(0, Vec::len))
    }

    /// Enter the recording section for one event. Fails once the
    /// transaction is read-only. Apply functions run inside the section and
    /// must not record events themselves.
    pub(crate) fn begin_recording(&self) -> CoreResult<RwLockReadGuard<'_, ()>> {
        let gate = self.recording.read().map_err(|_| poisoned("recording"))?;
        if self.is_read_only()? {
            return Err(CoreError::TransactionReadOnly);
        }
        Ok(gate)
    }

    pub(crate) fn push(&self, event: PendingEvent) -> CoreResult<()> {
        let mut queue = self.queue.lock().map_err(|_| poisoned("queue"))?;
        match queue.as_mut() {
            Some(events) => {
                events.push(event);
                Ok(())
            }
            None => Err(CoreError::TransactionReadOnly),
        }
    }

    pub(crate) fn track<T: Aggregate>(&self, key: ObjectKey, cell: Arc<EntityCell<T>>) -> CoreResult<()> {
        self.objects
            .write()
            .map_err(|_| poisoned("objects"))?
            .insert(
                key,
                ObjectSlot {
                    type_name: T::TYPE_NAME,
                    cell,
                },
            );
        Ok(())
    }

    pub(crate) fn identity_of(&self, key: ObjectKey) -> CoreResult<Option<Identity>> {
        Ok(self
            .identities
            .read()
            .map_err(|_| poisoned("identities"))?
            .get(&key)
            .cloned())
    }

    /// The tracked instance behind `key`.
    pub(crate) fn lookup_object<T: Aggregate>(self: &Arc<Self>, key: ObjectKey) -> CoreResult<Entity<T>> {
        let objects = self.objects.read().map_err(|_| poisoned("objects"))?;
        let slot = objects.get(&key).ok_or_else(|| {
            CoreError::InvalidState(format!("{key:?} is not tracked by this transaction"))
        })?;
        let cell = Arc::clone(&slot.cell)
            .downcast::<EntityCell<T>>()
            .map_err(|_| {
                CoreError::InvalidState(format!(
                    "{key:?} is a {}, not a {}",
                    slot.type_name,
                    T::TYPE_NAME
                ))
            })?;
        Ok(Entity::from_parts(key, cell, Arc::clone(self)))
    }

    fn cached<T: Aggregate>(self: &Arc<Self>, identity: &Identity) -> CoreResult<Option<Entity<T>>> {
        let key = match self
            .entities
            .read()
            .map_err(|_| poisoned("entities"))?
            .get(identity)
        {
            Some(key) => *key,
            None => return Ok(None),
        };
        let objects = self.objects.read().map_err(|_| poisoned("objects"))?;
        let slot = objects
            .get(&key)
            .ok_or_else(|| CoreError::InvalidState(format!("{identity} has no tracked instance")))?;
        let cell = Arc::clone(&slot.cell)
            .downcast::<EntityCell<T>>()
            .map_err(|_| CoreError::EntityTypeMismatch {
                identity: identity.clone(),
                expected: T::TYPE_NAME.to_string(),
                found: slot.type_name.to_string(),
            })?;
        Ok(Some(Entity::from_parts(key, cell, Arc::clone(self))))
    }

    /// Materialize the committed entity `identity`, or return the instance
    /// this context already tracks for it.
    pub(crate) fn try_get_entity<T: Aggregate>(
        self: &Arc<Self>,
        identity: &Identity,
    ) -> CoreResult<Option<Entity<T>>> {
        if !self.catalog.supports::<T>() {
            debug!(
                transaction_type = self.catalog.transaction_type,
                type_name = T::TYPE_NAME,
                "entity type not in catalog"
            );
            return Err(CoreError::UnsupportedEntityType(T::TYPE_NAME.to_string()));
        }
        if let Some(entity) = self.cached::<T>(identity)? {
            return Ok(Some(entity));
        }

        let records = self.shared.repository.load_entity(identity)?;
        if records.is_empty() {
            return Ok(None);
        }
        let cell = self.replay::<T>(&records)?;
        debug!(
            identity = %identity,
            type_name = T::TYPE_NAME,
            events = records.len(),
            "entity materialized"
        );
        self.adopt(identity, cell).map(Some)
    }

    pub(crate) fn get_entity<T: Aggregate>(self: &Arc<Self>, identity: &Identity) -> CoreResult<Entity<T>> {
        self.try_get_entity(identity)?
            .ok_or_else(|| CoreError::EntityNotFound(identity.clone()))
    }

    /// Rebuild an instance from its records: the first opens it through a
    /// catalog constructor, the rest are applied in order.
    pub(crate) fn replay<T: Aggregate>(
        self: &Arc<Self>,
        records: &[EventRecord],
    ) -> CoreResult<Arc<EntityCell<T>>> {
        let (first, rest) = records
            .split_first()
            .ok_or_else(|| CoreError::InvalidState("nothing to replay".into()))?;
        let weak = Arc::downgrade(self);

        let key = EventKey::new(&first.event_name, first.param_names());
        let (params, constructor) = self.catalog.constructor::<T>(&key)?;
        let args = Args::from_params(&first.params);
        check_args(&first.event_name, params, &args)?;
        let cell = EntityCell::replaying(constructor(&EventArgs::new(
            first.event_name.clone(),
            args,
            weak.clone(),
        ))?);

        let schema = schema_of::<T>()?;
        {
            let mut state = cell.write()?;
            for record in rest {
                let key = EventKey::new(&record.event_name, record.param_names());
                let (decl, apply) = schema.find_apply(&key)?;
                let args = Args::from_params(&record.params);
                decl.check(&args)?;
                apply(
                    &mut state.value,
                    &EventArgs::new(record.event_name.clone(), args, weak.clone()),
                )?;
            }
            state.mode = Mode::Recording;
        }
        Ok(cell)
    }

    /// Register a replayed instance under `identity`. If another thread got
    /// there first, its instance wins.
    fn adopt<T: Aggregate>(
        self: &Arc<Self>,
        identity: &Identity,
        cell: Arc<EntityCell<T>>,
    ) -> CoreResult<Entity<T>> {
        let mut entities = self.entities.write().map_err(|_| poisoned("entities"))?;
        if entities.contains_key(identity) {
            drop(entities);
            return self
                .cached::<T>(identity)?
                .ok_or_else(|| CoreError::EntityNotFound(identity.clone()));
        }
        let key = ObjectKey::next();
        self.track(key, Arc::clone(&cell))?;
        self.identities
            .write()
            .map_err(|_| poisoned("identities"))?
            .insert(key, identity.clone());
        entities.insert(identity.clone(), key);
        Ok(Entity::from_parts(key, cell, Arc::clone(self)))
    }

    /// Register the root instance of a loaded transaction.
    pub(crate) fn install_root<T: Aggregate>(
        self: &Arc<Self>,
        identity: &Identity,
        cell: Arc<EntityCell<T>>,
    ) -> CoreResult<Entity<T>> {
        let mut entities = self.entities.write().map_err(|_| poisoned("entities"))?;
        self.track(self.root, Arc::clone(&cell))?;
        self.identities
            .write()
            .map_err(|_| poisoned("identities"))?
            .insert(self.root, identity.clone());
        entities.insert(identity.clone(), self.root);
        Ok(Entity::from_parts(self.root, cell, Arc::clone(self)))
    }

    /// Drain the queue and persist it as one pending batch.
    ///
    /// The context is read-only afterwards, whether or not the backend
    /// accepted the batch. Returns the transaction identity.
    pub(crate) fn save(&self) -> CoreResult<Identity> {
        let events = {
            let _closing = self.recording.write().map_err(|_| poisoned("recording"))?;
            self.queue
                .lock()
                .map_err(|_| poisoned("queue"))?
                .take()
                .ok_or(CoreError::TransactionReadOnly)?
        };
        let count = events.len();
        let known = self
            .identities
            .read()
            .map_err(|_| poisoned("identities"))?
            .clone();

        let stamped = RefCell::new(None);
        let failure = RefCell::new(None);
        let (events_ref, stamped_ref, failure_ref) = (&events, &stamped, &failure);
        let root = self.root;
        let producer: EventProducer<'_> = Box::new(move |generator: &dyn IdentityGenerator| {
            match resolver::stamp(root, events_ref, known, generator) {
                Ok(batch) => {
                    *stamped_ref.borrow_mut() = Some(batch.assigned);
                    Ok(batch.records)
                }
                Err(err) => {
                    let message = err.to_string();
                    *failure_ref.borrow_mut() = Some(err);
                    Err(StoreError::ProducerAborted(message))
                }
            }
        });

        if let Err(err) = self.shared.repository.save_transaction(count, producer) {
            warn!(error = %err, events = count, "transaction save failed");
            return Err(failure.into_inner().unwrap_or_else(|| err.into()));
        }

        let assigned: HashMap<ObjectKey, Identity> = stamped.into_inner().unwrap_or_default();
        {
            let mut entities = self.entities.write().map_err(|_| poisoned("entities"))?;
            let mut identities = self.identities.write().map_err(|_| poisoned("identities"))?;
            for (key, identity) in &assigned {
                identities.insert(*key, identity.clone());
                entities.insert(identity.clone(), *key);
            }
        }
        let transaction = self
            .identity_of(self.root)?
            .ok_or(CoreError::EntityHasNoIdentity)?;
        info!(
            transaction = %transaction,
            events = count,
            new_identities = assigned.len(),
            "transaction saved"
        );
        Ok(transaction)
    }

    pub(crate) fn commit(&self, transaction: &Identity) -> CoreResult<()> {
        self.shared.repository.commit_transaction(transaction)?;
        info!(transaction = %transaction, "transaction committed");
        Ok(())
    }

    pub(crate) fn rollback(&self, transaction: &Identity) -> CoreResult<()> {
        self.shared.repository.rollback_transaction(transaction)?;
        info!(transaction = %transaction, "transaction rolled back");
        Ok(())
    }
}
