use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use transact_types::Identity;

use crate::args::{Arg, ObjectKey};
use crate::context::ContextInner;
use crate::entity::{Entity, EntityCell};
use crate::error::{CoreError, CoreResult};
use crate::schema::Aggregate;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Target {
    /// An entity read back from storage.
    Stored(Identity),
    /// A live instance, possibly without an identity yet.
    Object(ObjectKey),
}

struct Resolved<T> {
    key: ObjectKey,
    cell: Arc<EntityCell<T>>,
}

/// Lazily resolved handle to another entity.
///
/// A reference holds only a weak link to its transaction context, so
/// aggregates may keep references to each other (including cycles) without
/// keeping the context alive. The first successful [`load`](Reference::load)
/// is memoized and shared by every clone.
pub struct Reference<T: Aggregate> {
    target: Target,
    ctx: Weak<ContextInner>,
    resolved: Arc<OnceLock<Resolved<T>>>,
}

impl<T: Aggregate> Reference<T> {
    pub(crate) fn stored(identity: Identity, ctx: Weak<ContextInner>) -> Self {
        Self {
            target: Target::Stored(identity),
            ctx,
            resolved: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn object(key: ObjectKey, ctx: Weak<ContextInner>) -> Self {
        Self {
            target: Target::Object(key),
            ctx,
            resolved: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn loaded(entity: &Entity<T>) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(Resolved {
            key: entity.key(),
            cell: entity.cell(),
        });
        Self {
            target: Target::Object(entity.key()),
            ctx: Arc::downgrade(entity.context()),
            resolved: Arc::new(resolved),
        }
    }

    pub(crate) fn to_arg(&self) -> Arg {
        match &self.target {
            Target::Stored(identity) => Arg::Stored {
                identity: identity.clone(),
                type_name: T::TYPE_NAME,
            },
            Target::Object(key) => Arg::Object {
                key: *key,
                type_name: T::TYPE_NAME,
            },
        }
    }

    /// Identity of the target. Always known for references read from
    /// storage; known for live instances once their transaction is saved.
    pub fn identity(&self) -> Option<Identity> {
        match &self.target {
            Target::Stored(identity) => Some(identity.clone()),
            Target::Object(key) => self
                .ctx
                .upgrade()
                .and_then(|ctx| ctx.identity_of(*key).ok().flatten()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Resolve the target, loading it through the owning context on first
    /// use.
    pub fn load(&self) -> CoreResult<Entity<T>> {
        let ctx = self.ctx.upgrade().ok_or(CoreError::ContextClosed)?;
        if let Some(resolved) = self.resolved.get() {
            return Ok(Entity::from_parts(
                resolved.key,
                Arc::clone(&resolved.cell),
                ctx,
            ));
        }
        let entity = match &self.target {
            Target::Stored(identity) => ctx.get_entity::<T>(identity)?,
            Target::Object(key) => ctx.lookup_object::<T>(*key)?,
        };
        let _ = self.resolved.set(Resolved {
            key: entity.key(),
            cell: entity.cell(),
        });
        Ok(entity)
    }
}

impl<T: Aggregate> Clone for Reference<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            ctx: self.ctx.clone(),
            resolved: Arc::clone(&self.resolved),
        }
    }
}

impl<T: Aggregate> PartialEq for Reference<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.target == other.target {
            return true;
        }
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Aggregate> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("type", &T::TYPE_NAME)
            .field("target", &self.target)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
