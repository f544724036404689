//! Process-wide caches of validated schemas and per-transaction catalogs.

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use crate::args::EventArgs;
use crate::error::{poisoned, CoreError, CoreResult};
use crate::schema::{Aggregate, Constructor, EventKey, ParamKind, Schema, SchemaBuilder, TransactionType};

type Cache = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn schemas() -> &'static Cache {
    static SCHEMAS: OnceLock<Cache> = OnceLock::new();
    SCHEMAS.get_or_init(|| RwLock::new(HashMap::new()))
}

fn catalogs() -> &'static Cache {
    static CATALOGS: OnceLock<Cache> = OnceLock::new();
    CATALOGS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Look up a cached entry, building it outside the lock on a miss.
///
/// Concurrent builders race benignly: the first insert wins and every
/// caller gets that entry.
fn cached<V, F>(cache: &'static Cache, key: TypeId, build: F) -> CoreResult<Arc<V>>
where
    V: Send + Sync + 'static,
    F: FnOnce() -> V,
{
    {
        let map = cache.read().map_err(|_| poisoned("registry read"))?;
        if let Some(entry) = map.get(&key) {
            return Arc::clone(entry)
                .downcast::<V>()
                .map_err(|_| CoreError::InvalidState("registry entry has the wrong type".into()));
        }
    }
    let built: Arc<dyn Any + Send + Sync> = Arc::new(build());
    let mut map = cache.write().map_err(|_| poisoned("registry write"))?;
    Arc::clone(map.entry(key).or_insert(built))
        .downcast::<V>()
        .map_err(|_| CoreError::InvalidState("registry entry has the wrong type".into()))
}

/// The validated schema of `T`, built on first use.
///
/// Validation failures are cached too, so a broken type reports the same
/// error on every call.
pub(crate) fn schema_of<T: Aggregate>() -> CoreResult<Arc<Schema<T>>> {
    let entry = cached(schemas(), TypeId::of::<T>(), || {
        let mut builder = SchemaBuilder::<T>::new();
        T::schema(&mut builder);
        let result = builder.build().map(Arc::new);
        debug!(type_name = T::TYPE_NAME, ok = result.is_ok(), "schema registered");
        result
    })?;
    (*entry).clone()
}

/// How to build an entity of one type from a creation record.
pub(crate) struct ConstructorEntry {
    key: EventKey,
    params: Vec<(&'static str, ParamKind)>,
    /// A `Constructor<C>` for the entity type.
    build: Arc<dyn Any + Send + Sync>,
}

/// Every entity type reachable from one transaction type through creation
/// events, with the constructors that open them.
pub(crate) struct Catalog {
    pub(crate) transaction_type: &'static str,
    pub(crate) root_event_name: &'static str,
    entities: HashMap<TypeId, &'static str>,
    constructors: HashMap<TypeId, Vec<ConstructorEntry>>,
}

impl Catalog {
    pub(crate) fn supports<T: Aggregate>(&self) -> bool {
        self.entities.contains_key(&TypeId::of::<T>())
    }

    pub(crate) fn entity_types(&self) -> BTreeSet<&'static str> {
        self.entities.values().copied().collect()
    }

    /// The constructor matching a creation record's name and parameters.
    pub(crate) fn constructor<T: Aggregate>(
        &self,
        key: &EventKey,
    ) -> CoreResult<(&[(&'static str, ParamKind)], Constructor<T>)> {
        let entry = self
            .constructors
            .get(&TypeId::of::<T>())
            .and_then(|entries| entries.iter().find(|e| &e.key == key))
            .ok_or_else(|| CoreError::UnknownEvent {
                type_name: T::TYPE_NAME.to_string(),
                event: key.name.clone(),
                params: key.params.join(", "),
            })?;
        let ctor = entry
            .build
            .downcast_ref::<Constructor<T>>()
            .ok_or_else(|| CoreError::InvalidState(format!("constructor of {key} has the wrong type")))?;
        Ok((&entry.params, *ctor))
    }
}

/// Walks creation events transitively from a transaction type.
pub(crate) struct CatalogBuilder {
    entities: HashMap<TypeId, &'static str>,
    constructors: HashMap<TypeId, Vec<ConstructorEntry>>,
}

impl CatalogBuilder {
    pub(crate) fn visit<C: Aggregate>(&mut self) -> CoreResult<()> {
        if self.entities.contains_key(&TypeId::of::<C>()) {
            return Ok(());
        }
        self.entities.insert(TypeId::of::<C>(), C::TYPE_NAME);
        let schema = schema_of::<C>()?;
        for (decl, creation) in schema.creations() {
            let key = EventKey::new(decl.name, decl.params.iter().map(|(p, _)| *p));
            let entries = self.constructors.entry(creation.target).or_default();
            if !entries.iter().any(|e| e.key == key) {
                entries.push(ConstructorEntry {
                    key,
                    params: decl.params.clone(),
                    build: Arc::clone(&creation.build),
                });
            }
            (creation.visit)(self)?;
        }
        Ok(())
    }
}

fn open_transaction<X: TransactionType>(_args: &EventArgs) -> CoreResult<X> {
    Ok(X::default())
}

/// Name of the parameter carrying a transaction's description.
pub(crate) const DESCRIPTION_PARAM: &str = "description";

/// The catalog of transaction type `X`, built on first use.
pub(crate) fn catalog_for<X: TransactionType>() -> CoreResult<Arc<Catalog>> {
    let entry = cached(catalogs(), TypeId::of::<X>(), || {
        let mut builder = CatalogBuilder {
            entities: HashMap::new(),
            constructors: HashMap::new(),
        };
        let result = builder.visit::<X>().map(|()| {
            let root: Constructor<X> = open_transaction::<X>;
            builder
                .constructors
                .entry(TypeId::of::<X>())
                .or_default()
                .push(ConstructorEntry {
                    key: EventKey::new(X::ROOT_EVENT_NAME, [DESCRIPTION_PARAM]),
                    params: vec![(DESCRIPTION_PARAM, ParamKind::Text)],
                    build: Arc::new(root),
                });
            Arc::new(Catalog {
                transaction_type: X::TYPE_NAME,
                root_event_name: X::ROOT_EVENT_NAME,
                entities: builder.entities,
                constructors: builder.constructors,
            })
        });
        match &result {
            Ok(catalog) => debug!(
                transaction_type = X::TYPE_NAME,
                entity_types = ?catalog.entity_types(),
                "catalog built"
            ),
            Err(err) => debug!(transaction_type = X::TYPE_NAME, error = %err, "catalog rejected"),
        }
        result
    })?;
    (*entry).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        ChildTestEntity, Customer, Order, OrderTransaction, Product, TestEntity, TestTransaction,
    };

    #[test]
    fn schema_is_cached_per_type() {
        let a = schema_of::<TestEntity>().unwrap();
        let b = schema_of::<TestEntity>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn catalog_reaches_transitive_creations() {
        let catalog = catalog_for::<TestTransaction>().unwrap();
        assert!(catalog.supports::<TestTransaction>());
        assert!(catalog.supports::<TestEntity>());
        assert!(catalog.supports::<ChildTestEntity>());
        assert!(!catalog.supports::<Order>());
        assert_eq!(catalog.root_event_name, "TestTransaction");
    }

    #[test]
    fn order_catalog_covers_its_graph() {
        let catalog = catalog_for::<OrderTransaction>().unwrap();
        let types = catalog.entity_types();
        for name in ["OrderTransaction", "Order", "Product", "Customer"] {
            assert!(types.contains(name), "missing {name}");
        }
        assert!(!catalog.supports::<TestEntity>());
        assert!(catalog.supports::<Product>() && catalog.supports::<Customer>());
    }

    #[test]
    fn root_constructor_is_registered() {
        let catalog = catalog_for::<TestTransaction>().unwrap();
        let key = EventKey::new("TestTransaction", [DESCRIPTION_PARAM]);
        assert!(catalog.constructor::<TestTransaction>(&key).is_ok());
        assert!(matches!(
            catalog.constructor::<TestEntity>(&EventKey::new("Nope", [])),
            Err(CoreError::UnknownEvent { .. })
        ));
    }

    #[test]
    fn concurrent_first_use_agrees() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| catalog_for::<OrderTransaction>().unwrap()))
            .collect();
        let catalogs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(catalogs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
