use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use transact_types::{Identity, Value};

use crate::context::ContextInner;
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::reference::Reference;
use crate::schema::Aggregate;

static NEXT_OBJECT_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique key of an in-memory entity instance.
///
/// Keys are never reused, so they can index per-context side tables
/// without tying those tables to object addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(u64);

impl ObjectKey {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJECT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey(#{})", self.0)
    }
}

/// One event argument as supplied by a caller or decoded from storage.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// A primitive, or an identity reference read back from storage.
    Value(Value),
    /// A live entity instance, resolved to its identity at save.
    Object {
        key: ObjectKey,
        type_name: &'static str,
    },
    /// A reference to an entity that already has an identity.
    Stored {
        identity: Identity,
        type_name: &'static str,
    },
}

impl Arg {
    /// Short description of what the argument holds, for diagnostics.
    pub fn kind_name(&self) -> String {
        match self {
            Self::Value(v) => v.kind_name().to_string(),
            Self::Object { type_name, .. } | Self::Stored { type_name, .. } => {
                format!("entity {type_name}")
            }
        }
    }
}

/// Conversion into an event argument.
pub trait IntoArg {
    fn into_arg(self) -> Arg;
}

impl<V: Into<Value>> IntoArg for V {
    fn into_arg(self) -> Arg {
        Arg::Value(self.into())
    }
}

impl IntoArg for Arg {
    fn into_arg(self) -> Arg {
        self
    }
}

impl<T: Aggregate> IntoArg for &Entity<T> {
    fn into_arg(self) -> Arg {
        Arg::Object {
            key: self.key(),
            type_name: T::TYPE_NAME,
        }
    }
}

impl<T: Aggregate> IntoArg for &Reference<T> {
    fn into_arg(self) -> Arg {
        self.to_arg()
    }
}

/// Named arguments of one event call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args(BTreeMap<String, Arg>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument, replacing any previous one with the same name.
    pub fn with(mut self, name: impl Into<String>, value: impl IntoArg) -> Self {
        self.0.insert(name.into(), value.into_arg());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arg)> {
        self.0.iter()
    }

    pub(crate) fn from_params(params: &transact_types::Params) -> Self {
        Self(
            params
                .iter()
                .map(|(k, v)| (k.clone(), Arg::Value(v.clone())))
                .collect(),
        )
    }
}

/// Arguments as seen by an apply function or constructor.
///
/// Identity values are handed out as [`Reference`]s bound to the context
/// that is applying the event, so they can be resolved on demand.
pub struct EventArgs {
    event: String,
    args: Args,
    ctx: Weak<ContextInner>,
}

impl EventArgs {
    pub(crate) fn new(event: impl Into<String>, args: Args, ctx: Weak<ContextInner>) -> Self {
        Self {
            event: event.into(),
            args,
            ctx,
        }
    }

    /// Name of the event being applied.
    pub fn event(&self) -> &str {
        &self.event
    }

    fn arg(&self, name: &str) -> CoreResult<&Arg> {
        self.args.get(name).ok_or_else(|| CoreError::MissingParam {
            event: self.event.clone(),
            param: name.to_string(),
        })
    }

    fn mismatch(&self, name: &str, expected: &str, found: &Arg) -> CoreError {
        CoreError::ParamKindMismatch {
            event: self.event.clone(),
            param: name.to_string(),
            expected: expected.to_string(),
            found: found.kind_name(),
        }
    }

    /// The raw value of a primitive argument.
    pub fn value(&self, name: &str) -> CoreResult<&Value> {
        match self.arg(name)? {
            Arg::Value(v) => Ok(v),
            other => Err(self.mismatch(name, "value", other)),
        }
    }

    pub fn text(&self, name: &str) -> CoreResult<&str> {
        match self.arg(name)? {
            Arg::Value(Value::Text(s)) => Ok(s),
            other => Err(self.mismatch(name, "text", other)),
        }
    }

    pub fn optional_text(&self, name: &str) -> CoreResult<Option<&str>> {
        match self.arg(name)? {
            Arg::Value(Value::Null) => Ok(None),
            Arg::Value(Value::Text(s)) => Ok(Some(s)),
            other => Err(self.mismatch(name, "text", other)),
        }
    }

    pub fn int(&self, name: &str) -> CoreResult<i64> {
        match self.arg(name)? {
            Arg::Value(Value::Int(i)) => Ok(*i),
            other => Err(self.mismatch(name, "int", other)),
        }
    }

    pub fn float(&self, name: &str) -> CoreResult<f64> {
        let arg = self.arg(name)?;
        match arg {
            Arg::Value(v) => v.as_float().ok_or_else(|| self.mismatch(name, "float", arg)),
            other => Err(self.mismatch(name, "float", other)),
        }
    }

    pub fn bool(&self, name: &str) -> CoreResult<bool> {
        match self.arg(name)? {
            Arg::Value(Value::Bool(b)) => Ok(*b),
            other => Err(self.mismatch(name, "bool", other)),
        }
    }

    /// A reference to the entity passed as `name`.
    pub fn reference<C: Aggregate>(&self, name: &str) -> CoreResult<Reference<C>> {
        self.optional_reference(name)?.ok_or_else(|| CoreError::ParamKindMismatch {
            event: self.event.clone(),
            param: name.to_string(),
            expected: format!("entity {}", C::TYPE_NAME),
            found: "null".into(),
        })
    }

    pub fn optional_reference<C: Aggregate>(&self, name: &str) -> CoreResult<Option<Reference<C>>> {
        let arg = self.arg(name)?;
        match arg {
            Arg::Value(Value::Null) => Ok(None),
            Arg::Value(Value::Ref(id)) => Ok(Some(Reference::stored(id.clone(), self.ctx.clone()))),
            Arg::Stored {
                identity,
                type_name,
            } if *type_name == C::TYPE_NAME => {
                Ok(Some(Reference::stored(identity.clone(), self.ctx.clone())))
            }
            Arg::Object { key, type_name } if *type_name == C::TYPE_NAME => {
                Ok(Some(Reference::object(*key, self.ctx.clone())))
            }
            other => Err(self.mismatch(name, &format!("entity {}", C::TYPE_NAME), other)),
        }
    }
}
