//! The unit of work.
//!
//! A [`UnitOfWork`] owns exactly one store session for its whole life and
//! exposes typed queries, attach/detach, deletes and `save_changes` on top of
//! it. It is the sole owner of the entities it tracks: entities only carry the
//! unit of work's [`ContextId`], never a reference back to it.
//!
//! Operations on one unit of work are meant to be issued by one logical caller
//! at a time. The identity map itself tolerates concurrent attach and detach.

use crate::cascade::{CascadeDelete, cancellation_mode};
use crate::filters::{FilterRegistry, FilterSet, FilterSuspension};
use crate::flush::SavePlan;
use crate::identity_map::{ContextDirectory, IdentityMap};
use crate::n1_detection::{N1QueryTracker, N1Stats};
use crate::registry::{Capability, EntityInfo, EntityRegistry, read_entity, write_entity};
use crate::{SaveEvent, SaveEventCallbacks, UnitOfWorkConfig};
use asupersync::{Cx, Outcome};
use chrono::Utc;
use docmodel_core::{
    ContextId, DISCRIMINATOR_FIELD, Document, Entity, EntityRef, Error, Filter, MergedWriteResult,
    RelationSource, Result, ServiceMap, ServiceResolver, SourceFuture, StoreSession,
    TransactionErrorKind, document_id, from_document,
};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Rows of a shared collection that belong to exactly this type.
///
/// Root rows written before the family became polymorphic carry no
/// discriminator and still count as the root type.
fn type_filter(info: &EntityInfo) -> Filter {
    if !info.polymorphic {
        return Filter::All;
    }
    let exact = Filter::eq(DISCRIMINATOR_FIELD, info.name);
    if info.is_root() {
        exact.or(Filter::Exists(DISCRIMINATOR_FIELD.to_string(), false))
    } else {
        exact
    }
}

/// Per-request persistence context over one store session.
pub struct UnitOfWork<S: StoreSession> {
    id: ContextId,
    session: S,
    supports_transactions: bool,
    registry: Arc<EntityRegistry>,
    identity: Arc<IdentityMap>,
    directory: ContextDirectory,
    filters: Arc<FilterSet>,
    config: UnitOfWorkConfig,
    /// An explicit transaction is open.
    explicit: AtomicBool,
    events: Mutex<SaveEventCallbacks>,
    n1: Mutex<Option<N1QueryTracker>>,
    disposed: AtomicBool,
}

impl<S: StoreSession> UnitOfWork<S> {
    /// Wrap `session`. `supports_transactions` reports the store's topology.
    pub fn new(session: S, supports_transactions: bool, registry: Arc<EntityRegistry>) -> Self {
        let id = ContextId::next();
        let identity = Arc::new(IdentityMap::new(id));
        let directory = ContextDirectory::new();
        directory.register(&identity);

        Self {
            id,
            session,
            supports_transactions,
            registry,
            identity,
            directory,
            filters: Arc::new(FilterSet::new(
                Arc::new(FilterRegistry::new()),
                Arc::new(ServiceMap::new()),
            )),
            config: UnitOfWorkConfig::default(),
            explicit: AtomicBool::new(false),
            events: Mutex::new(SaveEventCallbacks::default()),
            n1: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: UnitOfWorkConfig) -> Self {
        *lock(&self.n1) = config
            .n1_threshold
            .map(|threshold| N1QueryTracker::new().with_threshold(threshold));
        self.config = config;
        self
    }

    /// Build this unit of work's filters from `registry`, resolving services through `resolver`.
    #[must_use]
    pub fn with_filters(mut self, registry: Arc<FilterRegistry>, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.filters = Arc::new(FilterSet::new(registry, resolver));
        self
    }

    /// Join a directory shared with other units of work.
    #[must_use]
    pub fn with_directory(mut self, directory: ContextDirectory) -> Self {
        self.directory.unregister(self.id);
        directory.register(&self.identity);
        self.directory = directory;
        self
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &Arc<IdentityMap> {
        &self.identity
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn filters(&self) -> &Arc<FilterSet> {
        &self.filters
    }

    pub fn supports_transactions(&self) -> bool {
        self.supports_transactions
    }

    /// Is any transaction (implicit or explicit) open on the session?
    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    pub fn in_explicit_transaction(&self) -> bool {
        self.explicit.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a callback run at the start of every `save_changes`.
    pub fn on_pre_save_changes(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        lock(&self.events).on_pre_save(f);
    }

    /// Register a callback run after every successful `save_changes`.
    pub fn on_post_save_changes(
        &self,
        f: impl FnMut(&MergedWriteResult) -> Result<()> + Send + 'static,
    ) {
        lock(&self.events).on_post_save(f);
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track `entity`, assigning its id and creation time if it has none.
    ///
    /// If an entity with the same id is already tracked, that instance is
    /// returned and `entity` is discarded.
    pub fn attach<E: Entity>(&self, mut entity: E) -> Result<EntityRef<E>> {
        let info = self.registry.info::<E>()?;
        entity.meta_mut().assign_identity();
        let handle = Arc::new(RwLock::new(entity));
        if !self.config.track_entities {
            return Ok(handle);
        }
        self.identity.attach(info, handle)
    }

    /// Track an existing handle, taking it over from another live unit of work.
    pub fn attach_ref<E: Entity>(&self, handle: EntityRef<E>) -> Result<EntityRef<E>> {
        let info = self.registry.info::<E>()?;
        let (id, previous) = {
            let mut entity = write_entity(&handle);
            entity.meta_mut().assign_identity();
            (entity.id().map(str::to_string), entity.meta().context())
        };

        if let (Some(owner), Some(id)) = (previous, id.as_deref()) {
            if owner != self.id {
                if let Some(map) = self.directory.lookup(owner) {
                    let moved = map.detach_handle(info.root, id, &handle);
                    tracing::debug!(target: "docmodel::uow", from = %owner, to = %self.id, id, moved, "entity ownership transferred");
                }
            }
        }

        if !self.config.track_entities {
            return Ok(handle);
        }
        self.identity.attach(info, handle)
    }

    /// Assign id and creation time without tracking.
    pub fn attach_no_tracking<E: Entity>(&self, entity: &mut E) {
        entity.meta_mut().assign_identity();
    }

    /// Stop tracking `handle`'s id. Returns whether anything was tracked.
    pub fn detach<E: Entity>(&self, handle: &EntityRef<E>) -> Result<bool> {
        let info = self.registry.info::<E>()?;
        let (id, owner) = {
            let entity = read_entity(handle);
            (entity.id().map(str::to_string), entity.meta().context())
        };
        let id = id.ok_or_else(|| Error::Argument(format!("cannot detach a {} without an id", info.name)))?;

        let removed = self.identity.detach(info.root, &id);
        if owner == Some(self.id) {
            write_entity(handle).meta_mut().set_context(None);
        }
        Ok(removed)
    }

    /// Stop tracking the given ids of `E`'s family.
    pub fn detach_ids<E: Entity>(&self, ids: &[String]) -> Result<usize> {
        let info = self.registry.info::<E>()?;
        Ok(self.identity.detach_many(info.root, ids))
    }

    pub fn is_tracked<E: Entity>(&self, id: &str) -> bool {
        self.registry
            .info::<E>()
            .is_ok_and(|info| self.identity.contains(info.root, id))
    }

    pub fn tracked_count(&self) -> usize {
        self.identity.len()
    }

    /// Does any tracked entity differ from its last known server state?
    ///
    /// `save_changes` writes the whole working set either way.
    pub fn has_changes(&self) -> Result<bool> {
        let plan = SavePlan::build(&self.registry, &self.identity, Utc::now())?;
        Ok(plan.dirty_count() > 0)
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Suspend marker `M`'s filter until the returned guard drops.
    pub fn disable_filter<M: Capability>(&self) -> FilterSuspension {
        self.filters.suspend::<M>()
    }

    /// Suspend every filter until the returned guard drops.
    pub fn disable_all_filters(&self) -> FilterSuspension {
        self.filters.suspend_all()
    }

    // ========================================================================
    // N+1 detection
    // ========================================================================

    pub fn enable_n1_detection(&self, threshold: usize) {
        *lock(&self.n1) = Some(N1QueryTracker::new().with_threshold(threshold));
    }

    pub fn disable_n1_detection(&self) {
        *lock(&self.n1) = None;
    }

    pub fn n1_stats(&self) -> Option<N1Stats> {
        lock(&self.n1).as_ref().map(N1QueryTracker::stats)
    }

    pub fn reset_n1_tracking(&self) {
        if let Some(tracker) = lock(&self.n1).as_mut() {
            tracker.reset();
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Run a filtered find for `info`'s type, applying data filters on both sides.
    async fn fetch_documents(&self, cx: &Cx, info: &EntityInfo, filter: Filter) -> Outcome<Vec<Document>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = filter.validate() {
            return Outcome::Err(e);
        }
        let pipeline = self.filters.pipeline_for(info);
        let filter = pipeline.pre_filter(info, filter).and(type_filter(info));

        let mut docs = match self.session.find(cx, &info.collection, &filter).await {
            Outcome::Ok(docs) => docs,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Some(post) = pipeline.post_filter(info) {
            let before = docs.len();
            docs.retain(|doc| post.matches(doc));
            tracing::trace!(
                target: "docmodel::filter",
                entity = info.name,
                removed = before - docs.len(),
                "post-filter applied"
            );
        }
        Outcome::Ok(docs)
    }

    /// Decode a store document into the tracked handle for its id.
    fn materialize<E: Entity>(&self, info: &EntityInfo, doc: Document) -> Result<EntityRef<E>> {
        if !self.config.track_entities {
            return Ok(Arc::new(RwLock::new(from_document::<E>(doc)?)));
        }
        let id = document_id(&doc)
            .map(str::to_string)
            .ok_or_else(|| Error::Custom(format!("{} document without an _id", info.name)))?;
        if let Some(existing) = self.identity.get::<E>(info.root, &id) {
            return Ok(existing);
        }
        let entity = from_document::<E>(doc.clone())?;
        let handle = self.identity.attach(info, Arc::new(RwLock::new(entity)))?;
        self.identity.set_snapshot_if_absent(info.root, &id, doc);
        Ok(handle)
    }

    /// Query `E`, returning tracked handles.
    ///
    /// Ids already tracked resolve to the tracked instance.
    #[tracing::instrument(level = "debug", skip(self, cx, filter), fields(uow = %self.id, entity = E::DISCRIMINATOR))]
    pub async fn query<E: Entity>(&self, cx: &Cx, filter: Filter) -> Outcome<Vec<EntityRef<E>>, Error> {
        let info = match self.registry.info::<E>() {
            Ok(info) => info,
            Err(e) => return Outcome::Err(e),
        };
        let docs = match self.fetch_documents(cx, info, filter).await {
            Outcome::Ok(docs) => docs,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.materialize::<E>(info, doc) {
                Ok(handle) => out.push(handle),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(out)
    }

    /// Query `E` without registering the results.
    #[tracing::instrument(level = "debug", skip(self, cx, filter), fields(uow = %self.id, entity = E::DISCRIMINATOR))]
    pub async fn query_no_tracking<E: Entity>(&self, cx: &Cx, filter: Filter) -> Outcome<Vec<E>, Error> {
        let info = match self.registry.info::<E>() {
            Ok(info) => info,
            Err(e) => return Outcome::Err(e),
        };
        let docs = match self.fetch_documents(cx, info, filter).await {
            Outcome::Ok(docs) => docs,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match from_document::<E>(doc) {
                Ok(entity) => out.push(entity),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(out)
    }

    /// The tracked entity with `id`, or the store's copy.
    pub async fn find_by_id<E: Entity>(&self, cx: &Cx, id: &str) -> Outcome<Option<EntityRef<E>>, Error> {
        let info = match self.registry.info::<E>() {
            Ok(info) => info,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(tracked) = self.identity.get::<E>(info.root, id) {
            return Outcome::Ok(Some(tracked));
        }
        match self.query::<E>(cx, Filter::id(id)).await {
            Outcome::Ok(mut found) => Outcome::Ok(found.pop()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Count `E` rows matching `filter`.
    ///
    /// Fails when a filter with a post-filter applies to `E`: the store cannot
    /// count what is only filtered after materialization.
    #[tracing::instrument(level = "debug", skip(self, cx, filter), fields(uow = %self.id, entity = E::DISCRIMINATOR))]
    pub async fn count<E: Entity>(&self, cx: &Cx, filter: Filter) -> Outcome<u64, Error> {
        let info = match self.registry.info::<E>() {
            Ok(info) => info,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = filter.validate() {
            return Outcome::Err(e);
        }
        let pipeline = self.filters.pipeline_for(info);
        if pipeline.post_filter(info).is_some() {
            return Outcome::Err(Error::UnsupportedPostFilterCount {
                entity_type: E::DISCRIMINATOR,
            });
        }
        let filter = pipeline.pre_filter(info, filter).and(type_filter(info));
        self.session.count(cx, &info.collection, &filter).await
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    /// Start a delete request for `E`. It must be given ids or a filter.
    pub fn delete<E: Entity>(&self) -> DeleteRequest<'_, S, E> {
        DeleteRequest {
            uow: self,
            ids: None,
            filter: None,
            cancellable: false,
            _entity: PhantomData,
        }
    }

    /// Delete one entity by its id.
    pub async fn delete_entity<E: Entity>(&self, cx: &Cx, handle: &EntityRef<E>) -> Outcome<u64, Error> {
        let id = read_entity(handle).id().map(str::to_string);
        let Some(id) = id else {
            return Outcome::Err(Error::Argument(format!(
                "cannot delete a {} without an id",
                E::DISCRIMINATOR
            )));
        };
        self.delete_ids::<E>(cx, &[id]).await
    }

    /// Delete an id set, batching by the configured batch size.
    pub async fn delete_ids<E: Entity>(&self, cx: &Cx, ids: &[String]) -> Outcome<u64, Error> {
        self.run_delete::<E>(cx, DeleteTarget::Ids(ids), false).await
    }

    /// Delete every `E` row matching `filter`.
    pub async fn delete_where<E: Entity>(&self, cx: &Cx, filter: Filter) -> Outcome<u64, Error> {
        self.run_delete::<E>(cx, DeleteTarget::Where(filter), false).await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, target), fields(uow = %self.id, entity = E::DISCRIMINATOR))]
    async fn run_delete<E: Entity>(
        &self,
        cx: &Cx,
        target: DeleteTarget<'_>,
        cancellable: bool,
    ) -> Outcome<u64, Error> {
        let info = match self.registry.info::<E>() {
            Ok(info) => info,
            Err(e) => return Outcome::Err(e),
        };
        // A bad pattern under `not` would match every row.
        if let DeleteTarget::Where(filter) = &target {
            if let Err(e) = filter.validate() {
                return Outcome::Err(e);
            }
        }
        let mode = match cancellation_mode(
            cancellable,
            cx.cancel_reason().is_some(),
            self.session.in_transaction(),
            CascadeDelete::<S>::is_multi_collection(info),
        ) {
            Ok(mode) => mode,
            Err(e) => return Outcome::Err(e),
        };
        if mode == crate::cascade::CancellationMode::Honored {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
        }

        let pipeline = self.filters.pipeline_for(info);
        let engine = CascadeDelete::new(
            &self.session,
            &self.identity,
            info,
            self.config.delete_batch_size,
            mode,
        );

        match target {
            DeleteTarget::Ids(ids) if pipeline.is_empty() && info.is_root() => {
                engine.delete_ids(cx, ids).await
            }
            // Ids that are filtered out, or name a row of another type in the
            // family, go through the predicate path and keep their chunks.
            DeleteTarget::Ids(ids) => {
                let filter = pipeline.pre_filter(info, Filter::ids(ids.iter().cloned()));
                engine.delete_where(cx, filter).await
            }
            DeleteTarget::Where(filter) => {
                engine.delete_where(cx, pipeline.pre_filter(info, filter)).await
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction that `save_changes` will not commit on its own.
    pub async fn start_explicit_transaction(&self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if !self.supports_transactions {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::NotSupported,
                "the connected topology does not support transactions",
            ));
        }
        if let Err(e) = self
            .session
            .start_transaction(&self.config.session.default_transaction)
        {
            return Outcome::Err(e);
        }
        self.explicit.store(true, Ordering::SeqCst);
        tracing::debug!(target: "docmodel::uow", uow = %self.id, "explicit transaction started");
        Outcome::Ok(())
    }

    pub async fn commit_explicit_transaction(&self, cx: &Cx) -> Outcome<(), Error> {
        if !self.explicit.load(Ordering::SeqCst) {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "no explicit transaction is open",
            ));
        }
        let outcome = self.session.commit_transaction(cx).await;
        if matches!(outcome, Outcome::Ok(())) {
            self.explicit.store(false, Ordering::SeqCst);
            tracing::debug!(target: "docmodel::uow", uow = %self.id, "explicit transaction committed");
        }
        outcome
    }

    pub async fn abort_explicit_transaction(&self, cx: &Cx) -> Outcome<(), Error> {
        if !self.explicit.swap(false, Ordering::SeqCst) {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "no explicit transaction is open",
            ));
        }
        tracing::debug!(target: "docmodel::uow", uow = %self.id, "explicit transaction aborted");
        self.session.abort_transaction(cx).await
    }

    /// Abort whatever transaction is open, logging rather than returning failures.
    async fn abort_quietly(&self, cx: &Cx) {
        if !self.session.in_transaction() {
            return;
        }
        match self.session.abort_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(target: "docmodel::uow", uow = %self.id, error = %e, "transaction abort failed");
            }
            Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                tracing::warn!(target: "docmodel::uow", uow = %self.id, "transaction abort interrupted");
            }
        }
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Persist the whole working set and return the merged write counts.
    ///
    /// Outside an explicit transaction, and on a topology that supports it,
    /// the save runs in an implicit transaction that is committed here. With
    /// entity tracking disabled this logs an error and persists nothing.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(uow = %self.id))]
    pub async fn save_changes(&self, cx: &Cx) -> Outcome<MergedWriteResult, Error> {
        if !self.config.track_entities {
            tracing::error!(
                target: "docmodel::save",
                uow = %self.id,
                "save_changes called with entity tracking disabled; nothing was persisted"
            );
            return Outcome::Ok(MergedWriteResult::default());
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = lock(&self.events).fire(SaveEvent::PreSaveChanges) {
            return Outcome::Err(e);
        }

        let implicit = !self.session.in_transaction()
            && self.supports_transactions
            && !self.explicit.load(Ordering::SeqCst);
        if implicit {
            if let Err(e) = self
                .session
                .start_transaction(&self.config.session.default_transaction)
            {
                return Outcome::Err(e);
            }
        }

        let mut plan = match SavePlan::build(&self.registry, &self.identity, Utc::now()) {
            Ok(plan) => plan,
            Err(e) => {
                if implicit {
                    self.abort_quietly(cx).await;
                }
                return Outcome::Err(e);
            }
        };
        tracing::debug!(
            target: "docmodel::save",
            families = plan.family_count(),
            writes = plan.len(),
            implicit,
            "saving working set"
        );

        if plan.missing_created_on() > 0 {
            match plan.resolve_created_on(cx, &self.session).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    if implicit {
                        self.abort_quietly(cx).await;
                    }
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    if implicit {
                        self.abort_quietly(cx).await;
                    }
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let merged = match plan
            .execute(cx, &self.session, &self.identity, self.config.retry)
            .await
        {
            Outcome::Ok(merged) => merged,
            Outcome::Err(e) => {
                if e.is_concurrency_conflict() {
                    self.abort_quietly(cx).await;
                    self.explicit.store(false, Ordering::SeqCst);
                } else if implicit {
                    self.abort_quietly(cx).await;
                }
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                if implicit {
                    self.abort_quietly(cx).await;
                }
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                if implicit {
                    self.abort_quietly(cx).await;
                }
                return Outcome::Panicked(p);
            }
        };

        if implicit {
            match self.session.commit_transaction(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.abort_quietly(cx).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.abort_quietly(cx).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        plan.apply(&self.identity);

        if let Err(e) = lock(&self.events).fire(SaveEvent::PostSaveChanges(&merged)) {
            return Outcome::Err(e);
        }
        tracing::debug!(
            target: "docmodel::save",
            matched = merged.matched_count,
            modified = merged.modified_count,
            inserted = merged.inserted_count,
            "save complete"
        );
        Outcome::Ok(merged)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Abort any open transaction, then drop both identity-map tables.
    ///
    /// An explicit transaction still open here is aborted with a warning.
    pub async fn dispose(self, cx: &Cx) {
        if self.explicit.load(Ordering::SeqCst) {
            tracing::warn!(
                target: "docmodel::uow",
                uow = %self.id,
                "disposed with an open explicit transaction; aborting it"
            );
        }
        self.abort_quietly(cx).await;
        self.explicit.store(false, Ordering::SeqCst);
        self.release();
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.identity.clear();
        self.directory.unregister(self.id);
        tracing::debug!(target: "docmodel::uow", uow = %self.id, "unit of work released");
    }
}

impl<S: StoreSession> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if self.explicit.load(Ordering::SeqCst) || self.session.in_transaction() {
            tracing::warn!(
                target: "docmodel::uow",
                uow = %self.id,
                "dropped with an open transaction; the session discards it"
            );
        }
        self.release();
    }
}

impl<S: StoreSession> std::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("supports_transactions", &self.supports_transactions)
            .field("explicit_transaction", &self.in_explicit_transaction())
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The unit of work is the default data source of lazy relations.
impl<S: StoreSession, T: Entity> RelationSource<T> for UnitOfWork<S> {
    fn fetch<'a>(&'a self, cx: &'a Cx, filter: Filter) -> SourceFuture<'a, T> {
        Box::pin(self.query::<T>(cx, filter))
    }

    fn record_lazy_load(&self, owner: &'static str, property: &'static str) {
        if let Some(tracker) = lock(&self.n1).as_mut() {
            tracker.record_load(owner, property);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum DeleteTarget<'a> {
    Ids(&'a [String]),
    Where(Filter),
}

/// A delete against `E` under construction.
///
/// Executing it with neither ids nor a filter fails with
/// [`Error::MissingFilter`] before anything reaches the store.
#[must_use = "a delete request does nothing until executed"]
pub struct DeleteRequest<'a, S: StoreSession, E: Entity> {
    uow: &'a UnitOfWork<S>,
    ids: Option<Vec<String>>,
    filter: Option<Filter>,
    cancellable: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<S: StoreSession, E: Entity> DeleteRequest<'_, S, E> {
    pub fn ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.ids
            .get_or_insert_with(Vec::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Ask for the delete to observe cancellation.
    ///
    /// Outside a transaction this is refused for families with binary chunks.
    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub async fn execute(self, cx: &Cx) -> Outcome<u64, Error> {
        // An empty id list names nothing; it does not stand in for a filter.
        let ids = self.ids.filter(|ids| !ids.is_empty());
        match (ids, self.filter) {
            (None, None) => Outcome::Err(Error::MissingFilter {
                entity_type: E::DISCRIMINATOR,
            }),
            (Some(ids), None) => {
                self.uow
                    .run_delete::<E>(cx, DeleteTarget::Ids(&ids), self.cancellable)
                    .await
            }
            (None, Some(filter)) => {
                self.uow
                    .run_delete::<E>(cx, DeleteTarget::Where(filter), self.cancellable)
                    .await
            }
            (Some(ids), Some(filter)) => {
                let filter = filter.and(Filter::ids(ids));
                self.uow
                    .run_delete::<E>(cx, DeleteTarget::Where(filter), self.cancellable)
                    .await
            }
        }
    }
}
