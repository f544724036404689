use std::fmt;
use std::ops::Deref;

use transact_types::{Identity, TransactionRef};

use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::schema::{Aggregate, TransactionType};

/// A unit of work rooted at an `X`.
///
/// Dereferences to the root [`Entity<X>`], so events declared on the
/// transaction type are called directly on the handle.
pub struct Transaction<X: TransactionType> {
    root: Entity<X>,
}

impl<X: TransactionType> Transaction<X> {
    pub(crate) fn new(root: Entity<X>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Entity<X> {
        &self.root
    }

    /// The transaction identity, once saved or if loaded from storage.
    pub fn identity(&self) -> Option<Identity> {
        self.root.identity().ok()
    }

    pub fn description(&self) -> &str {
        self.root.context().description()
    }

    /// `true` once saved, and always for transactions loaded from storage.
    pub fn is_read_only(&self) -> bool {
        self.root.context().is_read_only().unwrap_or(true)
    }

    /// Persist every recorded event as one pending batch.
    ///
    /// Runs the store's post-save hook on success. Fails with
    /// [`CoreError::TransactionReadOnly`] if already saved.
    pub fn save(&self) -> CoreResult<Identity> {
        let ctx = self.root.context();
        let identity = ctx.save()?;
        ctx.shared.notify_saved(self);
        Ok(identity)
    }

    /// Make the transaction visible, saving it first if needed.
    pub fn commit(&self) -> CoreResult<()> {
        let identity = match self.identity() {
            Some(identity) => identity,
            None => self.save()?,
        };
        self.root.context().commit(&identity)
    }

    /// Discard a saved transaction.
    pub fn rollback(&self) -> CoreResult<()> {
        let identity = self.identity().ok_or(CoreError::EntityHasNoIdentity)?;
        self.root.context().rollback(&identity)
    }

    pub fn get_entity<T: Aggregate>(&self, identity: &Identity) -> CoreResult<Entity<T>> {
        self.root.context().get_entity(identity)
    }

    /// Like [`get_entity`](Self::get_entity), but `Ok(None)` when nothing
    /// is committed under `identity`.
    pub fn try_get_entity<T: Aggregate>(&self, identity: &Identity) -> CoreResult<Option<Entity<T>>> {
        self.root.context().try_get_entity(identity)
    }

    /// Identity of an entity tracked by this transaction.
    pub fn get_identity<T: Aggregate>(&self, entity: &Entity<T>) -> CoreResult<Identity> {
        self.root
            .context()
            .identity_of(entity.key())?
            .ok_or(CoreError::EntityHasNoIdentity)
    }
}

impl<X: TransactionType> Deref for Transaction<X> {
    type Target = Entity<X>;

    fn deref(&self) -> &Entity<X> {
        &self.root
    }
}

impl<X: TransactionType> fmt::Debug for Transaction<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("type", &X::TYPE_NAME)
            .field("identity", &self.identity())
            .field("description", &self.description())
            .finish()
    }
}

/// Object-safe view of a transaction of any type.
pub trait AnyTransaction: Send + Sync {
    fn identity(&self) -> Option<Identity>;
    fn type_name(&self) -> &'static str;
    fn root_event_name(&self) -> &'static str;
    fn description(&self) -> &str;
    fn is_read_only(&self) -> bool;
    fn save(&self) -> CoreResult<Identity>;
    fn commit(&self) -> CoreResult<()>;
    fn rollback(&self) -> CoreResult<()>;

    /// Wire shape for handing the transaction to another process.
    fn to_ref(&self) -> CoreResult<TransactionRef> {
        let identity = self.identity().ok_or(CoreError::EntityHasNoIdentity)?;
        Ok(TransactionRef::new(identity, self.type_name()))
    }
}

impl<X: TransactionType> AnyTransaction for Transaction<X> {
    fn identity(&self) -> Option<Identity> {
        Transaction::identity(self)
    }

    fn type_name(&self) -> &'static str {
        X::TYPE_NAME
    }

    fn root_event_name(&self) -> &'static str {
        X::ROOT_EVENT_NAME
    }

    fn description(&self) -> &str {
        Transaction::description(self)
    }

    fn is_read_only(&self) -> bool {
        Transaction::is_read_only(self)
    }

    fn save(&self) -> CoreResult<Identity> {
        Transaction::save(self)
    }

    fn commit(&self) -> CoreResult<()> {
        Transaction::commit(self)
    }

    fn rollback(&self) -> CoreResult<()> {
        Transaction::rollback(self)
    }
}
