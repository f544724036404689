use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use transact_types::Identity;

use crate::args::{Args, EventArgs, ObjectKey};
use crate::context::{ContextInner, PendingEvent};
use crate::error::{poisoned, CoreError, CoreResult};
use crate::reference::Reference;
use crate::registry::schema_of;
use crate::schema::{Aggregate, EventKey};

/// Whether an instance is being rebuilt from history or accepting new
/// events. Instances move from `Replaying` to `Recording` exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Replaying,
    Recording,
}

pub(crate) struct CellState<T> {
    pub(crate) value: T,
    pub(crate) mode: Mode,
}

/// Shared storage of one entity instance inside a context.
pub(crate) struct EntityCell<T> {
    state: RwLock<CellState<T>>,
}

impl<T> EntityCell<T> {
    pub(crate) fn recording(value: T) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(CellState {
                value,
                mode: Mode::Recording,
            }),
        })
    }

    pub(crate) fn replaying(value: T) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(CellState {
                value,
                mode: Mode::Replaying,
            }),
        })
    }

    pub(crate) fn read(&self) -> CoreResult<RwLockReadGuard<'_, CellState<T>>> {
        self.state.read().map_err(|_| poisoned("entity read"))
    }

    pub(crate) fn write(&self) -> CoreResult<RwLockWriteGuard<'_, CellState<T>>> {
        self.state.write().map_err(|_| poisoned("entity write"))
    }
}

/// Handle to an entity tracked by a transaction context.
///
/// Every state change goes through [`emit`](Entity::emit) or
/// [`create`](Entity::create), which record the call in the context's queue
/// and apply it through the function declared in `T`'s schema. Applications
/// usually wrap these in an extension trait with one typed method per event.
pub struct Entity<T: Aggregate> {
    key: ObjectKey,
    cell: Arc<EntityCell<T>>,
    ctx: Arc<ContextInner>,
}

impl<T: Aggregate> Clone for Entity<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            cell: Arc::clone(&self.cell),
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<T: Aggregate> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &T::TYPE_NAME)
            .field("key", &self.key)
            .finish()
    }
}

impl<T: Aggregate> Entity<T> {
    pub(crate) fn from_parts(key: ObjectKey, cell: Arc<EntityCell<T>>, ctx: Arc<ContextInner>) -> Self {
        Self { key, cell, ctx }
    }

    pub(crate) fn cell(&self) -> Arc<EntityCell<T>> {
        Arc::clone(&self.cell)
    }

    pub(crate) fn context(&self) -> &Arc<ContextInner> {
        &self.ctx
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    /// The identity assigned to this instance, once its transaction is
    /// saved or if it was loaded from storage.
    pub fn identity(&self) -> CoreResult<Identity> {
        self.ctx
            .identity_of(self.key)?
            .ok_or(CoreError::EntityHasNoIdentity)
    }

    /// Read the current state.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> CoreResult<R> {
        let state = self.cell.read()?;
        Ok(f(&state.value))
    }

    /// A reference to this instance, already resolved.
    pub fn reference(&self) -> Reference<T> {
        Reference::loaded(self)
    }

    pub fn is_recording(&self) -> CoreResult<bool> {
        Ok(self.cell.read()?.mode == Mode::Recording)
    }

    /// Record a unit event and apply it.
    ///
    /// The call is matched against the schema by event name and argument
    /// names. Fails with [`CoreError::TransactionReadOnly`] once the
    /// transaction is saved, in which case state is left unchanged.
    pub fn emit(&self, event: &str, args: Args) -> CoreResult<()> {
        let schema = schema_of::<T>()?;
        let (decl, apply) = schema.find_apply(&EventKey::new(event, args.names()))?;
        decl.check(&args)?;

        let _recording = self.ctx.begin_recording()?;
        let mut state = self.cell.write()?;
        if state.mode == Mode::Replaying {
            return Err(CoreError::InvalidState(format!(
                "event {event} invoked while {} is replaying",
                T::TYPE_NAME
            )));
        }
        let weak = Arc::downgrade(&self.ctx);
        apply(&mut state.value, &EventArgs::new(decl.name, args.clone(), weak))?;
        self.ctx.push(PendingEvent {
            root: self.key,
            event_name: decl.name.to_string(),
            args,
        })
    }

    /// Record a creation event and return the new entity.
    ///
    /// The child joins this context in recording mode and is rooted at
    /// itself: its identity is allocated when the transaction is saved.
    pub fn create<C: Aggregate>(&self, event: &str, args: Args) -> CoreResult<Entity<C>> {
        let schema = schema_of::<T>()?;
        let (decl, constructor) =
            schema.find_creation::<C>(&EventKey::new(event, args.names()))?;
        decl.check(&args)?;

        let _recording = self.ctx.begin_recording()?;
        if self.cell.read()?.mode == Mode::Replaying {
            return Err(CoreError::InvalidState(format!(
                "creation event {event} invoked while {} is replaying",
                T::TYPE_NAME
            )));
        }
        let weak = Arc::downgrade(&self.ctx);
        let value = constructor(&EventArgs::new(decl.name, args.clone(), weak))?;
        let child = ObjectKey::next();
        let cell = EntityCell::recording(value);
        self.ctx.track(child, Arc::clone(&cell))?;
        self.ctx.push(PendingEvent {
            root: child,
            event_name: decl.name.to_string(),
            args,
        })?;
        Ok(Entity::from_parts(child, cell, Arc::clone(&self.ctx)))
    }
}
