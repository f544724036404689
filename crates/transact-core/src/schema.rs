//! Event declarations for aggregates and transaction types.
//!
//! Every aggregate supplies a fixed table of events through
//! [`Aggregate::schema`]. The table is validated once per type, then cached
//! in the process-wide registry.

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use transact_types::Value;

use crate::args::{Arg, Args, EventArgs};
use crate::error::{CoreError, CoreResult};
use crate::registry::CatalogBuilder;

/// Applies a recorded or replayed event to the aggregate's state.
pub type Apply<T> = fn(&mut T, &EventArgs) -> CoreResult<()>;

/// Builds a new aggregate from its creation event.
pub type Constructor<C> = fn(&EventArgs) -> CoreResult<C>;

/// A domain aggregate whose state changes are declared as events.
pub trait Aggregate: Sized + Send + Sync + 'static {
    /// Stable name of the type, used in diagnostics and parameter kinds.
    const TYPE_NAME: &'static str;

    /// Declare every event of the type.
    fn schema(schema: &mut SchemaBuilder<Self>);
}

/// An aggregate that roots a unit of work.
///
/// The root event name identifies the type in storage and defaults to the
/// type name.
pub trait TransactionType: Aggregate + Default {
    const ROOT_EVENT_NAME: &'static str = Self::TYPE_NAME;
}

/// Declared kind of an event parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Text,
    /// Reference to an entity of the named type.
    Entity(&'static str),
}

impl ParamKind {
    pub fn entity<C: Aggregate>() -> Self {
        Self::Entity(C::TYPE_NAME)
    }

    /// Null is accepted for every kind.
    pub fn accepts(&self, arg: &Arg) -> bool {
        match (self, arg) {
            (_, Arg::Value(Value::Null)) => true,
            (Self::Bool, Arg::Value(Value::Bool(_))) => true,
            (Self::Int, Arg::Value(Value::Int(_))) => true,
            (Self::Float, Arg::Value(Value::Float(_) | Value::Int(_))) => true,
            (Self::Text, Arg::Value(Value::Text(_))) => true,
            (Self::Entity(_), Arg::Value(Value::Ref(_))) => true,
            (Self::Entity(expected), Arg::Object { type_name, .. })
            | (Self::Entity(expected), Arg::Stored { type_name, .. }) => expected == type_name,
            _ => false,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Text => f.write_str("text"),
            Self::Entity(name) => write!(f, "entity {name}"),
        }
    }
}

/// Who may invoke an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Public,
    Internal,
}

/// Whether calls go through the interceptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Intercepted,
    Direct,
}

/// What an event call hands back to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Returns {
    Unit,
    /// A plain value such as a number or string.
    Value(&'static str),
}

/// Full signature of a unit event, for declarations that need more than
/// the defaults of [`SchemaBuilder::event`].
#[derive(Clone, Debug)]
pub struct EventSignature {
    pub name: &'static str,
    pub params: Vec<(&'static str, ParamKind)>,
    pub access: Access,
    pub dispatch: Dispatch,
    pub returns: Returns,
}

impl EventSignature {
    pub fn new(name: &'static str, params: &[(&'static str, ParamKind)]) -> Self {
        Self {
            name,
            params: params.to_vec(),
            access: Access::Public,
            dispatch: Dispatch::Intercepted,
            returns: Returns::Unit,
        }
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn returns(mut self, returns: Returns) -> Self {
        self.returns = returns;
        self
    }
}

/// Events are matched by name and the set of parameter names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct EventKey {
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
}

impl EventKey {
    pub(crate) fn new<'a>(name: &str, params: impl IntoIterator<Item = &'a str>) -> Self {
        let params: BTreeSet<&str> = params.into_iter().collect();
        Self {
            name: name.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

pub(crate) struct Creation {
    pub(crate) target: TypeId,
    pub(crate) target_name: &'static str,
    /// A `Constructor<C>` for the target type.
    pub(crate) build: Arc<dyn Any + Send + Sync>,
    pub(crate) visit: fn(&mut CatalogBuilder) -> CoreResult<()>,
}

pub(crate) enum Handler<T> {
    Apply(Apply<T>),
    Create(Creation),
}

pub(crate) struct EventDecl<T> {
    pub(crate) name: &'static str,
    pub(crate) params: Vec<(&'static str, ParamKind)>,
    pub(crate) handler: Handler<T>,
}

impl<T> EventDecl<T> {
    pub(crate) fn check(&self, args: &Args) -> CoreResult<()> {
        check_args(self.name, &self.params, args)
    }
}

/// Check that every declared parameter is present with an accepted kind.
pub(crate) fn check_args(
    event: &str,
    params: &[(&'static str, ParamKind)],
    args: &Args,
) -> CoreResult<()> {
    for (param, kind) in params {
        let arg = args.get(param).ok_or_else(|| CoreError::MissingParam {
            event: event.to_string(),
            param: param.to_string(),
        })?;
        if !kind.accepts(arg) {
            return Err(CoreError::ParamKindMismatch {
                event: event.to_string(),
                param: param.to_string(),
                expected: kind.to_string(),
                found: arg.kind_name(),
            });
        }
    }
    Ok(())
}

/// Collects and validates the event table of one aggregate.
pub struct SchemaBuilder<T> {
    type_name: &'static str,
    events: Vec<EventDecl<T>>,
    errors: Vec<CoreError>,
}

impl<T: Aggregate> SchemaBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            type_name: T::TYPE_NAME,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Declare a public, intercepted unit event.
    pub fn event(
        &mut self,
        name: &'static str,
        params: &[(&'static str, ParamKind)],
        apply: Apply<T>,
    ) -> &mut Self {
        self.declare(EventSignature::new(name, params), apply)
    }

    /// Declare a unit event with an explicit signature.
    pub fn declare(&mut self, signature: EventSignature, apply: Apply<T>) -> &mut Self {
        let event = signature.name.to_string();
        let type_name = self.type_name.to_string();
        if signature.access != Access::Public {
            self.errors
                .push(CoreError::MethodMustBeCallable { type_name, event });
        } else if signature.dispatch != Dispatch::Intercepted {
            self.errors
                .push(CoreError::MethodMustBeOverridable { type_name, event });
        } else if let Returns::Value(returns) = signature.returns {
            self.errors.push(CoreError::MethodMustReturnVoidOrClass {
                type_name,
                event,
                returns: returns.to_string(),
            });
        } else {
            self.events.push(EventDecl {
                name: signature.name,
                params: signature.params,
                handler: Handler::Apply(apply),
            });
        }
        self
    }

    /// Declare a creation event that returns a new `C` rooted at itself.
    pub fn creates<C: Aggregate>(
        &mut self,
        name: &'static str,
        params: &[(&'static str, ParamKind)],
        constructor: Constructor<C>,
    ) -> &mut Self {
        self.events.push(EventDecl {
            name,
            params: params.to_vec(),
            handler: Handler::Create(Creation {
                target: TypeId::of::<C>(),
                target_name: C::TYPE_NAME,
                build: Arc::new(constructor),
                visit: CatalogBuilder::visit::<C>,
            }),
        });
        self
    }

    pub(crate) fn build(self) -> CoreResult<Schema<T>> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        let mut index = HashMap::new();
        for (i, decl) in self.events.iter().enumerate() {
            let key = EventKey::new(decl.name, decl.params.iter().map(|(p, _)| *p));
            if decl.params.len() != key.params.len() {
                return Err(CoreError::Config(format!(
                    "{}::{} declares a parameter twice",
                    self.type_name, decl.name
                )));
            }
            if index.insert(key.clone(), i).is_some() {
                return Err(CoreError::Config(format!(
                    "{}::{key} is declared twice",
                    self.type_name
                )));
            }
        }
        Ok(Schema {
            type_name: self.type_name,
            events: self.events,
            index,
        })
    }
}

/// Validated event table of one aggregate.
pub(crate) struct Schema<T> {
    pub(crate) type_name: &'static str,
    pub(crate) events: Vec<EventDecl<T>>,
    index: HashMap<EventKey, usize>,
}

impl<T: Aggregate> Schema<T> {
    pub(crate) fn find(&self, key: &EventKey) -> CoreResult<&EventDecl<T>> {
        self.index
            .get(key)
            .map(|&i| &self.events[i])
            .ok_or_else(|| CoreError::UnknownEvent {
                type_name: self.type_name.to_string(),
                event: key.name.clone(),
                params: key.params.join(", "),
            })
    }

    /// The apply function of a unit event.
    pub(crate) fn find_apply(&self, key: &EventKey) -> CoreResult<(&EventDecl<T>, Apply<T>)> {
        let decl = self.find(key)?;
        match &decl.handler {
            Handler::Apply(apply) => Ok((decl, *apply)),
            Handler::Create(_) => Err(CoreError::InvalidState(format!(
                "{}::{key} creates an entity and cannot be applied",
                self.type_name
            ))),
        }
    }

    /// The constructor of a creation event producing `C`.
    pub(crate) fn find_creation<C: Aggregate>(
        &self,
        key: &EventKey,
    ) -> CoreResult<(&EventDecl<T>, Constructor<C>)> {
        let decl = self.find(key)?;
        match &decl.handler {
            Handler::Create(creation) if creation.target == TypeId::of::<C>() => creation
                .build
                .downcast_ref::<Constructor<C>>()
                .map(|ctor| (decl, *ctor))
                .ok_or_else(|| {
                    CoreError::InvalidState(format!("constructor of {key} has the wrong type"))
                }),
            Handler::Create(creation) => Err(CoreError::InvalidState(format!(
                "{}::{key} creates {}, not {}",
                self.type_name,
                creation.target_name,
                C::TYPE_NAME
            ))),
            Handler::Apply(_) => Err(CoreError::InvalidState(format!(
                "{}::{key} is not a creation event",
                self.type_name
            ))),
        }
    }

    pub(crate) fn creations(&self) -> impl Iterator<Item = (&EventDecl<T>, &Creation)> {
        self.events.iter().filter_map(|decl| match &decl.handler {
            Handler::Create(creation) => Some((decl, creation)),
            Handler::Apply(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::schema_of;
    use crate::testing::{Customer, Order, TestEntity};

    struct Hidden;

    impl Aggregate for Hidden {
        const TYPE_NAME: &'static str = "Hidden";

        fn schema(schema: &mut SchemaBuilder<Self>) {
            schema.declare(
                EventSignature::new("Secret", &[]).access(Access::Internal),
                |_, _| Ok(()),
            );
        }
    }

    struct Sealed;

    impl Aggregate for Sealed {
        const TYPE_NAME: &'static str = "Sealed";

        fn schema(schema: &mut SchemaBuilder<Self>) {
            schema.declare(
                EventSignature::new("Fixed", &[]).dispatch(Dispatch::Direct),
                |_, _| Ok(()),
            );
        }
    }

    struct Counting;

    impl Aggregate for Counting {
        const TYPE_NAME: &'static str = "Counting";

        fn schema(schema: &mut SchemaBuilder<Self>) {
            schema.declare(
                EventSignature::new("Count", &[]).returns(Returns::Value("int")),
                |_, _| Ok(()),
            );
        }
    }

    struct Twice;

    impl Aggregate for Twice {
        const TYPE_NAME: &'static str = "Twice";

        fn schema(schema: &mut SchemaBuilder<Self>) {
            schema
                .event("Touch", &[("at", ParamKind::Int)], |_, _| Ok(()))
                .event("Touch", &[("at", ParamKind::Int)], |_, _| Ok(()));
        }
    }

    #[test]
    fn internal_events_are_rejected() {
        assert_eq!(
            schema_of::<Hidden>().err(),
            Some(CoreError::MethodMustBeCallable {
                type_name: "Hidden".into(),
                event: "Secret".into()
            })
        );
    }

    #[test]
    fn direct_events_are_rejected() {
        assert!(matches!(
            schema_of::<Sealed>(),
            Err(CoreError::MethodMustBeOverridable { .. })
        ));
    }

    #[test]
    fn value_returning_events_are_rejected() {
        assert!(matches!(
            schema_of::<Counting>(),
            Err(CoreError::MethodMustReturnVoidOrClass { .. })
        ));
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        assert!(matches!(schema_of::<Twice>(), Err(CoreError::Config(_))));
    }

    #[test]
    fn overloads_are_told_apart_by_parameter_names() {
        let schema = schema_of::<TestEntity>().unwrap();
        let one = EventKey::new("Rename", ["name"]);
        let two = EventKey::new("Rename", ["name", "suffix"]);
        assert!(schema.find_apply(&one).is_ok());
        assert!(schema.find_apply(&two).is_ok());
        assert!(matches!(
            schema.find(&EventKey::new("Rename", ["other"])),
            Err(CoreError::UnknownEvent { .. })
        ));
    }

    #[test]
    fn param_kinds_check_entity_types() {
        let order = schema_of::<Order>().unwrap();
        let (decl, _) = order
            .find_apply(&EventKey::new("AssignCustomer", ["customer"]))
            .unwrap();
        let wrong = Args::new().with("customer", 5);
        assert!(matches!(
            decl.check(&wrong),
            Err(CoreError::ParamKindMismatch { .. })
        ));
        assert_eq!(
            ParamKind::entity::<Customer>(),
            ParamKind::Entity("Customer")
        );
    }

    #[test]
    fn event_key_ignores_parameter_order() {
        assert_eq!(EventKey::new("E", ["b", "a"]), EventKey::new("E", ["a", "b"]));
        assert_eq!(EventKey::new("E", ["b", "a"]).to_string(), "E(a, b)");
    }
}
