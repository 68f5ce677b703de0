//! Lazy relation descriptors.
//!
//! A lazy relation is configured once per owner instance and property, the
//! first time the property is read. It carries:
//!
//! - a **per-owner rule** producing the filter that loads this owner's value
//! - a **batch rule** producing one filter that covers many owners at once
//! - an optional **data source**; without one, the caller's default source
//!   (normally the unit of work) is used
//! - the **cached value**, filled at most once
//!
//! # Example
//!
//! ```ignore
//! impl Order {
//!     fn customer_relation(&self) -> Arc<LazyOne<Order, Customer>> {
//!         self.meta.relations().one("customer", || {
//!             LazyOne::new(
//!                 "customer",
//!                 |o: &Order| Filter::id(o.customer_id.clone()),
//!                 |os: &[&Order]| Filter::ids(os.iter().map(|o| o.customer_id.clone())),
//!             )
//!         })
//!     }
//!
//!     async fn customer(&self, cx: &Cx, uow: &dyn RelationSource<Customer>)
//!         -> Outcome<Option<EntityRef<Customer>>, Error>
//!     {
//!         self.customer_relation().resolve(cx, self, uow).await
//!     }
//! }
//!
//! // One query for many owners instead of N:
//! LazyOne::load_batch(cx, &orders, |o| o.customer_relation(), &uow).await;
//! ```
//!
//! The cache belongs to the owner instance, and a clone starts with an empty
//! one. For a tracked owner behind an [`EntityRef`], take the descriptor
//! while holding the read guard and resolve it after the guard is dropped:
//!
//! ```ignore
//! let (relation, owner) = {
//!     let guard = order.read().unwrap();
//!     (guard.customer_relation(), guard.clone())
//! };
//! relation.resolve(cx, &owner, &uow).await;
//! ```

use crate::document::{Document, to_document};
use crate::entity::{Entity, EntityRef};
use crate::error::Error;
use crate::filter::Filter;
use asupersync::{Cx, Outcome};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};

/// Boxed future returned by [`RelationSource::fetch`].
pub type SourceFuture<'a, T> =
    Pin<Box<dyn Future<Output = Outcome<Vec<EntityRef<T>>, Error>> + Send + 'a>>;

/// A provider that can load related entities for a filter.
///
/// Object-safe so that a descriptor can hold an overriding source.
pub trait RelationSource<T: Entity>: Send + Sync {
    fn fetch<'a>(&'a self, cx: &'a Cx, filter: Filter) -> SourceFuture<'a, T>;

    /// Called once per single-owner load, for N+1 detection.
    fn record_lazy_load(&self, _owner: &'static str, _property: &'static str) {}
}

type OwnerRule<O> = Box<dyn Fn(&O) -> Filter + Send + Sync>;
type BatchRule<O> = Box<dyn Fn(&[&O]) -> Filter + Send + Sync>;

/// Per-instance cache of configured relation descriptors, keyed by property name.
#[derive(Default)]
pub struct RelationCache {
    slots: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl RelationCache {
    /// Get the single-value descriptor for `property`, configuring it on first use.
    pub fn one<O, T, F>(&self, property: &'static str, configure: F) -> Arc<LazyOne<O, T>>
    where
        O: 'static,
        T: Entity,
        F: FnOnce() -> LazyOne<O, T>,
    {
        self.slot(property, configure)
    }

    /// Get the collection-value descriptor for `property`, configuring it on first use.
    pub fn many<O, T, F>(&self, property: &'static str, configure: F) -> Arc<LazyMany<O, T>>
    where
        O: 'static,
        T: Entity,
        F: FnOnce() -> LazyMany<O, T>,
    {
        self.slot(property, configure)
    }

    /// Is a descriptor configured for `property`?
    pub fn is_configured(&self, property: &str) -> bool {
        self.lock().contains_key(property)
    }

    /// Drop every configured descriptor and cached value.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn slot<D, F>(&self, property: &'static str, configure: F) -> Arc<D>
    where
        D: Send + Sync + 'static,
        F: FnOnce() -> D,
    {
        let mut slots = self.lock();
        if let Some(existing) = slots.get(property) {
            if let Ok(descriptor) = Arc::clone(existing).downcast::<D>() {
                return descriptor;
            }
            tracing::debug!(
                property = property,
                "relation reconfigured with a different descriptor type"
            );
        }
        let descriptor = Arc::new(configure());
        slots.insert(property, Arc::clone(&descriptor) as Arc<dyn Any + Send + Sync>);
        descriptor
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, Arc<dyn Any + Send + Sync>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for RelationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.lock();
        let mut names: Vec<_> = slots.keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("RelationCache").field("configured", &names).finish()
    }
}

/// A lazily loaded single related entity.
pub struct LazyOne<O, T: Entity> {
    property: &'static str,
    rule: OwnerRule<O>,
    batch_rule: BatchRule<O>,
    source: Option<Arc<dyn RelationSource<T>>>,
    value: OnceLock<Option<EntityRef<T>>>,
}

impl<O: 'static, T: Entity> LazyOne<O, T> {
    pub fn new(
        property: &'static str,
        rule: impl Fn(&O) -> Filter + Send + Sync + 'static,
        batch_rule: impl Fn(&[&O]) -> Filter + Send + Sync + 'static,
    ) -> Self {
        Self {
            property,
            rule: Box::new(rule),
            batch_rule: Box::new(batch_rule),
            source: None,
            value: OnceLock::new(),
        }
    }

    /// Load from `source` instead of the caller's default source.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn RelationSource<T>>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn property(&self) -> &'static str {
        self.property
    }

    pub fn is_loaded(&self) -> bool {
        self.value.get().is_some()
    }

    /// The cached value, if loaded.
    pub fn get(&self) -> Option<Option<EntityRef<T>>> {
        self.value.get().cloned()
    }

    /// Filter loading `owner`'s related value.
    pub fn filter_for(&self, owner: &O) -> Filter {
        (self.rule)(owner)
    }

    /// Filter loading the related values of every owner in one query.
    pub fn batch_filter(&self, owners: &[&O]) -> Filter {
        (self.batch_rule)(owners)
    }

    /// Fill the cache without loading. Returns `false` if already loaded.
    pub fn prime(&self, value: Option<EntityRef<T>>) -> bool {
        self.value.set(value).is_ok()
    }

    /// Resolve the related value, loading it on first call.
    ///
    /// Errors are not cached; a later call retries the load.
    pub async fn resolve(
        &self,
        cx: &Cx,
        owner: &O,
        default_source: &dyn RelationSource<T>,
    ) -> Outcome<Option<EntityRef<T>>, Error> {
        if let Some(value) = self.value.get() {
            return Outcome::Ok(value.clone());
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let source = self.source.as_deref().unwrap_or(default_source);
        source.record_lazy_load(std::any::type_name::<O>(), self.property);

        let loaded = match source.fetch(cx, self.filter_for(owner)).await {
            Outcome::Ok(found) => found.into_iter().next(),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let _ = self.value.set(loaded);
        Outcome::Ok(self.value.get().cloned().flatten())
    }

    /// Load the relation for many owners with one query.
    ///
    /// Owners whose relation is already loaded are skipped. Results are
    /// distributed by evaluating each owner's own filter against the loaded
    /// documents. Returns the number of owners primed.
    pub async fn load_batch<D>(
        cx: &Cx,
        owners: &[&O],
        descriptor: D,
        default_source: &dyn RelationSource<T>,
    ) -> Outcome<usize, Error>
    where
        D: Fn(&O) -> Arc<LazyOne<O, T>>,
    {
        let pending: Vec<(&O, Arc<LazyOne<O, T>>)> = owners
            .iter()
            .map(|o| (*o, descriptor(o)))
            .filter(|(_, d)| !d.is_loaded())
            .collect();
        let Some((_, first)) = pending.first() else {
            return Outcome::Ok(0);
        };

        let pending_owners: Vec<&O> = pending.iter().map(|(o, _)| *o).collect();
        let filter = first.batch_filter(&pending_owners);
        let source = first.source.as_deref().unwrap_or(default_source);
        let loaded = match fetch_documents(cx, source, filter).await {
            Outcome::Ok(loaded) => loaded,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut primed = 0;
        for (owner, d) in &pending {
            let own = d.filter_for(owner);
            let value = loaded
                .iter()
                .find(|(doc, _)| own.matches(doc))
                .map(|(_, entity)| Arc::clone(entity));
            if d.prime(value) {
                primed += 1;
            }
        }
        Outcome::Ok(primed)
    }
}

/// A lazily loaded collection of related entities.
pub struct LazyMany<O, T: Entity> {
    property: &'static str,
    rule: OwnerRule<O>,
    batch_rule: BatchRule<O>,
    source: Option<Arc<dyn RelationSource<T>>>,
    value: OnceLock<Vec<EntityRef<T>>>,
}

impl<O: 'static, T: Entity> LazyMany<O, T> {
    pub fn new(
        property: &'static str,
        rule: impl Fn(&O) -> Filter + Send + Sync + 'static,
        batch_rule: impl Fn(&[&O]) -> Filter + Send + Sync + 'static,
    ) -> Self {
        Self {
            property,
            rule: Box::new(rule),
            batch_rule: Box::new(batch_rule),
            source: None,
            value: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn RelationSource<T>>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn property(&self) -> &'static str {
        self.property
    }

    pub fn is_loaded(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn get(&self) -> Option<Vec<EntityRef<T>>> {
        self.value.get().cloned()
    }

    pub fn filter_for(&self, owner: &O) -> Filter {
        (self.rule)(owner)
    }

    pub fn batch_filter(&self, owners: &[&O]) -> Filter {
        (self.batch_rule)(owners)
    }

    pub fn prime(&self, values: Vec<EntityRef<T>>) -> bool {
        self.value.set(values).is_ok()
    }

    /// Resolve the related collection, loading it on first call.
    pub async fn resolve(
        &self,
        cx: &Cx,
        owner: &O,
        default_source: &dyn RelationSource<T>,
    ) -> Outcome<Vec<EntityRef<T>>, Error> {
        if let Some(values) = self.value.get() {
            return Outcome::Ok(values.clone());
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let source = self.source.as_deref().unwrap_or(default_source);
        source.record_lazy_load(std::any::type_name::<O>(), self.property);

        let loaded = match source.fetch(cx, self.filter_for(owner)).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let _ = self.value.set(loaded);
        Outcome::Ok(self.value.get().cloned().unwrap_or_default())
    }

    /// Load the collection for many owners with one query.
    pub async fn load_batch<D>(
        cx: &Cx,
        owners: &[&O],
        descriptor: D,
        default_source: &dyn RelationSource<T>,
    ) -> Outcome<usize, Error>
    where
        D: Fn(&O) -> Arc<LazyMany<O, T>>,
    {
        let pending: Vec<(&O, Arc<LazyMany<O, T>>)> = owners
            .iter()
            .map(|o| (*o, descriptor(o)))
            .filter(|(_, d)| !d.is_loaded())
            .collect();
        let Some((_, first)) = pending.first() else {
            return Outcome::Ok(0);
        };

        let pending_owners: Vec<&O> = pending.iter().map(|(o, _)| *o).collect();
        let filter = first.batch_filter(&pending_owners);
        let source = first.source.as_deref().unwrap_or(default_source);
        let loaded = match fetch_documents(cx, source, filter).await {
            Outcome::Ok(loaded) => loaded,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut primed = 0;
        for (owner, d) in &pending {
            let own = d.filter_for(owner);
            let values = loaded
                .iter()
                .filter(|(doc, _)| own.matches(doc))
                .map(|(_, entity)| Arc::clone(entity))
                .collect();
            if d.prime(values) {
                primed += 1;
            }
        }
        Outcome::Ok(primed)
    }
}

/// Fetch through `source` and pair each result with its document form.
async fn fetch_documents<T: Entity>(
    cx: &Cx,
    source: &dyn RelationSource<T>,
    filter: Filter,
) -> Outcome<Vec<(Document, EntityRef<T>)>, Error> {
    let found = match source.fetch(cx, filter).await {
        Outcome::Ok(found) => found,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let mut paired = Vec::with_capacity(found.len());
    for entity in found {
        let doc = {
            let guard = match entity.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            to_document(&*guard)
        };
        match doc {
            Ok(doc) => paired.push((doc, entity)),
            Err(e) => return Outcome::Err(e),
        }
    }
    Outcome::Ok(paired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMeta;
    use asupersync::runtime::RuntimeBuilder;
    use serde::{Deserialize, Serialize};
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Customer {
        #[serde(flatten)]
        meta: EntityMeta,
        name: String,
    }

    impl Entity for Customer {
        const DISCRIMINATOR: &'static str = "Customer";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Order {
        #[serde(flatten)]
        meta: EntityMeta,
        customer_id: String,
    }

    impl Order {
        fn new(customer_id: &str) -> Self {
            Self {
                meta: EntityMeta::new(),
                customer_id: customer_id.to_string(),
            }
        }

        fn customer_relation(&self) -> Arc<LazyOne<Order, Customer>> {
            self.meta.relations().one("customer", || {
                LazyOne::new(
                    "customer",
                    |o: &Order| Filter::id(o.customer_id.clone()),
                    |os: &[&Order]| Filter::ids(os.iter().map(|o| o.customer_id.clone())),
                )
            })
        }
    }

    struct CountingSource {
        customers: Vec<EntityRef<Customer>>,
        fetches: AtomicUsize,
        lazy_loads: AtomicUsize,
    }

    impl CountingSource {
        fn new(ids: &[&str]) -> Self {
            let customers = ids
                .iter()
                .map(|id| {
                    Arc::new(RwLock::new(Customer {
                        meta: EntityMeta::with_id(*id),
                        name: format!("customer {id}"),
                    }))
                })
                .collect();
            Self {
                customers,
                fetches: AtomicUsize::new(0),
                lazy_loads: AtomicUsize::new(0),
            }
        }
    }

    impl RelationSource<Customer> for CountingSource {
        fn fetch<'a>(&'a self, _cx: &'a Cx, filter: Filter) -> SourceFuture<'a, Customer> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let found = self
                    .customers
                    .iter()
                    .filter(|c| {
                        let doc = to_document(&*c.read().unwrap()).unwrap();
                        filter.matches(&doc)
                    })
                    .cloned()
                    .collect();
                Outcome::Ok(found)
            })
        }

        fn record_lazy_load(&self, _owner: &'static str, _property: &'static str) {
            self.lazy_loads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[test]
    fn descriptor_configured_once_per_property() {
        let order = Order::new("c1");
        let a = order.customer_relation();
        let b = order.customer_relation();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(order.meta.relations().is_configured("customer"));
    }

    #[test]
    fn resolve_loads_exactly_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let source = CountingSource::new(&["c1", "c2"]);
        let order = Order::new("c1");

        rt.block_on(async {
            let first = unwrap_outcome(order.customer_relation().resolve(&cx, &order, &source).await);
            let second = unwrap_outcome(order.customer_relation().resolve(&cx, &order, &source).await);

            let first = first.expect("customer found");
            let second = second.expect("customer cached");
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(first.read().unwrap().name, "customer c1");
        });

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(source.lazy_loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_related_value_is_cached_as_none() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let source = CountingSource::new(&[]);
        let order = Order::new("ghost");

        rt.block_on(async {
            assert!(unwrap_outcome(order.customer_relation().resolve(&cx, &order, &source).await).is_none());
            assert!(unwrap_outcome(order.customer_relation().resolve(&cx, &order, &source).await).is_none());
        });
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn override_source_wins_over_default() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let default_source = CountingSource::new(&["c1"]);
        let override_source = Arc::new(CountingSource::new(&["c1"]));
        let order = Order::new("c1");
        let relation = order.meta.relations().one("customer", || {
            LazyOne::new(
                "customer",
                |o: &Order| Filter::id(o.customer_id.clone()),
                |os: &[&Order]| Filter::ids(os.iter().map(|o| o.customer_id.clone())),
            )
            .with_source(Arc::clone(&override_source) as Arc<dyn RelationSource<Customer>>)
        });

        rt.block_on(async {
            unwrap_outcome(relation.resolve(&cx, &order, &default_source).await);
        });
        assert_eq!(default_source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(override_source.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_load_uses_one_query_for_many_owners() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let source = CountingSource::new(&["c1", "c2", "c3"]);
        let orders = [Order::new("c1"), Order::new("c2"), Order::new("c2"), Order::new("zz")];
        let owners: Vec<&Order> = orders.iter().collect();

        rt.block_on(async {
            let primed = unwrap_outcome(
                LazyOne::<Order, Customer>::load_batch(
                    &cx,
                    &owners,
                    |o: &Order| o.customer_relation(),
                    &source,
                )
                .await,
            );
            assert_eq!(primed, 4);

            let c = unwrap_outcome(orders[1].customer_relation().resolve(&cx, &orders[1], &source).await)
                .expect("primed");
            assert_eq!(c.read().unwrap().name, "customer c2");
            assert!(
                unwrap_outcome(orders[3].customer_relation().resolve(&cx, &orders[3], &source).await)
                    .is_none()
            );
        });

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(source.lazy_loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn many_relation_filters_per_owner() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let source = CountingSource::new(&["a1", "a2", "b1"]);
        let order = Order::new("a");
        let relation = order.meta.relations().many("prefixed", || {
            LazyMany::new(
                "prefixed",
                |o: &Order| Filter::regex("_id", format!("^{}", o.customer_id)),
                |_: &[&Order]| Filter::All,
            )
        });

        rt.block_on(async {
            let found = unwrap_outcome(relation.resolve(&cx, &order, &source).await);
            assert_eq!(found.len(), 2);
            let again = unwrap_outcome(relation.resolve(&cx, &order, &source).await);
            assert_eq!(again.len(), 2);
        });
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }
}
