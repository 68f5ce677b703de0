//! Data filter pipeline.
//!
//! A [`FilterRegistry`] maps a capability marker type to a factory that builds
//! a [`DataFilter`] from a [`ServiceResolver`]. Each unit of work owns a
//! [`FilterSet`] that instantiates its own filters from the registry the first
//! time it needs them, so filters may carry per-context state (the current
//! tenant, say).
//!
//! For an operation against entity type `T`, every active filter whose marker
//! `T` carries contributes, in registration order:
//!
//! - a **pre-filter**: a transform of the predicate sent to the store
//! - an optional **post-filter**: a predicate evaluated in memory on the
//!   materialized documents
//!
//! Filters can be suspended per marker or all at once; the returned
//! [`FilterSuspension`] restores them when dropped. [`FilterRegistry::remove`]
//! removes a marker's filter permanently.

use crate::registry::{Capability, EntityInfo};
use docmodel_core::{Filter, ServiceResolver};
use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A pluggable query filter.
pub trait DataFilter: Send + Sync + 'static {
    /// Transform the predicate sent to the store.
    fn pre_filter(&self, entity: &EntityInfo, filter: Filter) -> Filter;

    /// A predicate applied after materialization, if the concern cannot be
    /// expressed store-side.
    fn post_filter(&self, _entity: &EntityInfo) -> Option<Filter> {
        None
    }
}

type FilterFactory = Arc<dyn Fn(&dyn ServiceResolver) -> Option<Arc<dyn DataFilter>> + Send + Sync>;

#[derive(Clone)]
struct RegistryEntry {
    marker: TypeId,
    marker_name: &'static str,
    order: usize,
    factory: FilterFactory,
}

/// Registry of filter factories keyed by capability marker.
#[derive(Default)]
pub struct FilterRegistry {
    entries: RwLock<Vec<RegistryEntry>>,
    next_order: AtomicUsize,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the filter factory for marker `M`, replacing any previous one.
    ///
    /// A replaced factory keeps its position in the registry order.
    pub fn register<M, F>(
        &self,
        factory: impl Fn(&dyn ServiceResolver) -> Option<F> + Send + Sync + 'static,
    ) where
        M: Capability,
        F: DataFilter,
    {
        let marker = TypeId::of::<M>();
        let factory: FilterFactory = Arc::new(move |resolver: &dyn ServiceResolver| {
            factory(resolver).map(|f| Arc::new(f) as Arc<dyn DataFilter>)
        });

        let mut entries = self.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.marker == marker) {
            existing.factory = factory;
            return;
        }
        entries.push(RegistryEntry {
            marker,
            marker_name: std::any::type_name::<M>(),
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            factory,
        });
    }

    /// Remove marker `M`'s filter permanently. Returns `false` if none was registered.
    pub fn remove<M: Capability>(&self) -> bool {
        let marker = TypeId::of::<M>();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|e| e.marker != marker);
        let removed = entries.len() != before;
        if removed {
            tracing::info!(
                target: "docmodel::filter",
                marker = std::any::type_name::<M>(),
                "data filter removed permanently"
            );
        }
        removed
    }

    pub fn contains<M: Capability>(&self) -> bool {
        self.contains_marker(TypeId::of::<M>())
    }

    fn contains_marker(&self, marker: TypeId) -> bool {
        self.read().iter().any(|e| e.marker == marker)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn snapshot(&self) -> Vec<RegistryEntry> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<RegistryEntry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<RegistryEntry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.read().iter().map(|e| e.marker_name).collect();
        f.debug_struct("FilterRegistry").field("markers", &names).finish()
    }
}

/// One instantiated filter inside a [`FilterSet`].
#[derive(Clone)]
pub struct ActiveFilter {
    pub marker: TypeId,
    pub marker_name: &'static str,
    pub filter: Arc<dyn DataFilter>,
    order: usize,
}

impl std::fmt::Debug for ActiveFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveFilter")
            .field("marker", &self.marker_name)
            .finish_non_exhaustive()
    }
}

/// The filters applicable to one operation, already resolved for an entity type.
#[derive(Default)]
pub struct FilterPipeline {
    filters: Vec<Arc<dyn DataFilter>>,
}

impl FilterPipeline {
    /// Apply every pre-filter in registration order.
    pub fn pre_filter(&self, entity: &EntityInfo, filter: Filter) -> Filter {
        self.filters
            .iter()
            .fold(filter, |acc, f| f.pre_filter(entity, acc))
    }

    /// The combined post-filter, if any filter declares one.
    pub fn post_filter(&self, entity: &EntityInfo) -> Option<Filter> {
        self.filters
            .iter()
            .filter_map(|f| f.post_filter(entity))
            .reduce(Filter::and)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }
}

/// Per-unit-of-work filter instances, built lazily from a [`FilterRegistry`].
pub struct FilterSet {
    registry: Arc<FilterRegistry>,
    resolver: Arc<dyn ServiceResolver>,
    active: Mutex<Option<Vec<ActiveFilter>>>,
}

impl FilterSet {
    pub fn new(registry: Arc<FilterRegistry>, resolver: Arc<dyn ServiceResolver>) -> Self {
        Self {
            registry,
            resolver,
            active: Mutex::new(None),
        }
    }

    /// Lock the active list, instantiating it on first use.
    fn lock(&self) -> MutexGuard<'_, Option<Vec<ActiveFilter>>> {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if active.is_none() {
            let built: Vec<ActiveFilter> = self
                .registry
                .snapshot()
                .into_iter()
                .filter_map(|entry| {
                    let filter = (entry.factory)(&*self.resolver);
                    if filter.is_none() {
                        tracing::debug!(
                            target: "docmodel::filter",
                            marker = entry.marker_name,
                            "filter factory declined for this context"
                        );
                    }
                    filter.map(|filter| ActiveFilter {
                        marker: entry.marker,
                        marker_name: entry.marker_name,
                        filter,
                        order: entry.order,
                    })
                })
                .collect();
            tracing::debug!(
                target: "docmodel::filter",
                count = built.len(),
                "data filters instantiated"
            );
            *active = Some(built);
        }
        active
    }

    /// Has this set instantiated its filters yet?
    pub fn is_initialized(&self) -> bool {
        match self.active.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Currently active filters, in registration order.
    ///
    /// Filters whose marker was removed from the registry are skipped.
    pub fn active(&self) -> Vec<ActiveFilter> {
        let active = self.lock();
        active
            .iter()
            .flatten()
            .filter(|f| self.registry.contains_marker(f.marker))
            .cloned()
            .collect()
    }

    /// The pipeline applicable to `entity`.
    pub fn pipeline_for(&self, entity: &EntityInfo) -> FilterPipeline {
        FilterPipeline {
            filters: self
                .active()
                .into_iter()
                .filter(|f| entity.has_capability(f.marker))
                .map(|f| f.filter)
                .collect(),
        }
    }

    /// Temporarily remove marker `M`'s filter from this set.
    pub fn suspend<M: Capability>(self: &Arc<Self>) -> FilterSuspension {
        let marker = TypeId::of::<M>();
        let removed = {
            let mut active = self.lock();
            let list = active.get_or_insert_with(Vec::new);
            let (removed, kept): (Vec<_>, Vec<_>) =
                list.drain(..).partition(|f| f.marker == marker);
            *list = kept;
            removed
        };
        tracing::debug!(
            target: "docmodel::filter",
            marker = std::any::type_name::<M>(),
            suspended = removed.len(),
            "data filter suspended"
        );
        FilterSuspension {
            set: Arc::clone(self),
            removed,
        }
    }

    /// Temporarily remove every filter from this set.
    pub fn suspend_all(self: &Arc<Self>) -> FilterSuspension {
        let removed = {
            let mut active = self.lock();
            // Leave an empty list behind so the set is not rebuilt from the registry.
            std::mem::take(active.get_or_insert_with(Vec::new))
        };
        tracing::debug!(
            target: "docmodel::filter",
            suspended = removed.len(),
            "all data filters suspended"
        );
        FilterSuspension {
            set: Arc::clone(self),
            removed,
        }
    }

    fn restore(&self, mut filters: Vec<ActiveFilter>) {
        if filters.is_empty() {
            return;
        }
        let mut active = self.lock();
        let list = active.get_or_insert_with(Vec::new);
        list.append(&mut filters);
        list.sort_by_key(|f| f.order);
    }
}

impl std::fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSet")
            .field("registry", &self.registry)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

/// Scope guard returned by filter suspension; restores the suspended filters on drop.
#[must_use = "filters are restored as soon as the suspension is dropped"]
pub struct FilterSuspension {
    set: Arc<FilterSet>,
    removed: Vec<ActiveFilter>,
}

impl FilterSuspension {
    /// Number of filters this scope suspended.
    pub fn suspended(&self) -> usize {
        self.removed.len()
    }
}

impl Drop for FilterSuspension {
    fn drop(&mut self) {
        let removed = std::mem::take(&mut self.removed);
        let count = removed.len();
        self.set.restore(removed);
        tracing::debug!(target: "docmodel::filter", restored = count, "data filters restored");
    }
}
