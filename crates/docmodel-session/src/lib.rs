//! Unit of work for DocModel Rust.
//!
//! `docmodel-session` is the **persistence layer** between application code and
//! a document store. It coordinates entity identity, bulk persistence, cascading
//! deletes and query filtering around one server session per unit of work.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one tracked `Arc<RwLock<E>>` per entity id, plus the last
//!   known server state of each.
//! - **Bulk persistence**: `save_changes` writes every family as one unordered
//!   bulk upsert, inside an implicit transaction when the topology allows it.
//! - **Cascading delete**: deletes by id, instance or predicate, including the
//!   binary chunks of content-bearing families.
//! - **Data filters**: per-context filter instances that rewrite outgoing
//!   predicates and filter materialized results.
//!
//! # Example
//!
//! ```ignore
//! let factory = UnitOfWorkFactory::new(store, Arc::new(registry));
//! let uow = factory.open(&cx).await?;
//!
//! let order = uow.attach(Order::new("pending"))?;
//! order.write().unwrap().status = "paid".into();
//!
//! let result = uow.save_changes(&cx).await?;
//! assert_eq!(result.inserted_count, 1);
//!
//! uow.dispose(&cx).await;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod filters;
pub mod flush;
pub mod identity_map;
pub mod n1_detection;
pub mod registry;
pub mod unit_of_work;

pub use cascade::{CancellationMode, CascadeDelete, cancellation_mode};
pub use change_tracker::{SnapshotSet, changed_fields, is_dirty};
pub use filters::{ActiveFilter, DataFilter, FilterPipeline, FilterRegistry, FilterSet, FilterSuspension};
pub use flush::{RetryPolicy, SavePlan, with_retry};
pub use identity_map::{ContextDirectory, IdentityMap, TrackedEntry};
pub use n1_detection::{N1DetectionScope, N1QueryTracker, N1Stats};
pub use registry::{
    Capability, ChunkCollection, EntityCodec, EntityInfo, EntityRegistry, EntityRegistryBuilder,
    ErasedEntity,
};
pub use unit_of_work::{DeleteRequest, UnitOfWork};

use asupersync::{Cx, Outcome};
use docmodel_core::{
    DocumentStore, Error, MergedWriteResult, Result, ServiceMap, ServiceResolver, SessionOptions,
};
use std::sync::Arc;

// ============================================================================
// Save Events
// ============================================================================

type PreSaveFn = Box<dyn FnMut() -> Result<()> + Send>;
type PostSaveFn = Box<dyn FnMut(&MergedWriteResult) -> Result<()> + Send>;

/// Callbacks fired once per `save_changes` call.
///
/// Pre-save callbacks run before any batching and can abort the save by
/// returning `Err`. Post-save callbacks receive the merged result.
#[derive(Default)]
pub struct SaveEventCallbacks {
    pre_save: Vec<PreSaveFn>,
    post_save: Vec<PostSaveFn>,
}

impl std::fmt::Debug for SaveEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveEventCallbacks")
            .field("pre_save", &self.pre_save.len())
            .field("post_save", &self.post_save.len())
            .finish()
    }
}

impl SaveEventCallbacks {
    pub fn on_pre_save(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.pre_save.push(Box::new(f));
    }

    pub fn on_post_save(&mut self, f: impl FnMut(&MergedWriteResult) -> Result<()> + Send + 'static) {
        self.post_save.push(Box::new(f));
    }

    fn fire(&mut self, event: SaveEvent<'_>) -> Result<()> {
        match event {
            SaveEvent::PreSaveChanges => {
                for cb in &mut self.pre_save {
                    cb()?;
                }
            }
            SaveEvent::PostSaveChanges(result) => {
                for cb in &mut self.post_save {
                    cb(result)?;
                }
            }
        }
        Ok(())
    }
}

/// Save lifecycle events.
#[derive(Debug, Clone, Copy)]
pub enum SaveEvent<'a> {
    /// Before the working set is batched.
    PreSaveChanges,
    /// After every family was written and any implicit transaction committed.
    PostSaveChanges(&'a MergedWriteResult),
}

// ============================================================================
// Configuration
// ============================================================================

/// Unit-of-work configuration.
#[derive(Debug, Clone)]
pub struct UnitOfWorkConfig {
    /// Register attached and queried entities in the identity map.
    ///
    /// With tracking off, `save_changes` persists nothing.
    pub track_entities: bool,
    /// Ids per cascading delete batch.
    pub delete_batch_size: usize,
    pub retry: RetryPolicy,
    pub session: SessionOptions,
    /// Enable N+1 detection with this threshold.
    pub n1_threshold: Option<usize>,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            track_entities: true,
            delete_batch_size: 100_000,
            retry: RetryPolicy::default(),
            session: SessionOptions::default(),
            n1_threshold: None,
        }
    }
}

impl UnitOfWorkConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn track_entities(mut self, value: bool) -> Self {
        self.track_entities = value;
        self
    }

    #[must_use]
    pub fn delete_batch_size(mut self, value: usize) -> Self {
        self.delete_batch_size = value.max(1);
        self
    }

    #[must_use]
    pub fn retry(mut self, value: RetryPolicy) -> Self {
        self.retry = value;
        self
    }

    #[must_use]
    pub fn session(mut self, value: SessionOptions) -> Self {
        self.session = value;
        self
    }

    #[must_use]
    pub fn n1_threshold(mut self, value: usize) -> Self {
        self.n1_threshold = Some(value);
        self
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Opens units of work against one store with shared registries.
pub struct UnitOfWorkFactory<D: DocumentStore> {
    store: D,
    registry: Arc<EntityRegistry>,
    filters: Arc<FilterRegistry>,
    services: Arc<dyn ServiceResolver>,
    directory: ContextDirectory,
    config: UnitOfWorkConfig,
}

impl<D: DocumentStore> UnitOfWorkFactory<D> {
    pub fn new(store: D, registry: Arc<EntityRegistry>) -> Self {
        Self {
            store,
            registry,
            filters: Arc::new(FilterRegistry::new()),
            services: Arc::new(ServiceMap::new()),
            directory: ContextDirectory::new(),
            config: UnitOfWorkConfig::default(),
        }
    }

    #[must_use]
    pub fn with_filters(mut self, filters: Arc<FilterRegistry>) -> Self {
        self.filters = filters;
        self
    }

    #[must_use]
    pub fn with_services(mut self, services: Arc<dyn ServiceResolver>) -> Self {
        self.services = services;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: UnitOfWorkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// The filter registry shared by every unit of work this factory opens.
    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    pub fn directory(&self) -> &ContextDirectory {
        &self.directory
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    /// Start a server session and wrap it in a new unit of work.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn open(&self, cx: &Cx) -> Outcome<UnitOfWork<D::Session>, Error> {
        let session = match self.store.start_session(cx, &self.config.session).await {
            Outcome::Ok(session) => session,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let uow = UnitOfWork::new(session, self.store.supports_transactions(), Arc::clone(&self.registry))
            .with_config(self.config.clone())
            .with_filters(Arc::clone(&self.filters), Arc::clone(&self.services))
            .with_directory(self.directory.clone());

        tracing::debug!(
            target: "docmodel::uow",
            uow = %uow.id(),
            transactions = uow.supports_transactions(),
            "unit of work opened"
        );
        Outcome::Ok(uow)
    }
}

impl<D: DocumentStore + std::fmt::Debug> std::fmt::Debug for UnitOfWorkFactory<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkFactory")
            .field("store", &self.store)
            .field("filters", &self.filters)
            .field("open_units", &self.directory.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
