//! Bulk persistence for `save_changes`.
//!
//! The working set is written family by family, in registration order:
//!
//! - every tracked entity of a family becomes one `ReplaceOne` upsert
//! - the whole family goes out as one unordered bulk write
//! - each bulk write retries on the store's transient-conflict signal only
//!
//! An entity with a snapshot carries its last known `ModifiedOn` in the
//! replace filter. If the server copy moved on, the filter misses, the upsert
//! collides on `_id`, and the duplicate key is reported as a concurrency
//! conflict naming the fields that changed server-side.
//!
//! Outside a transaction a failed save can still have landed some writes.
//! Those are recorded in the identity map before the error is returned, so
//! the next save is guarded against the state this save produced.

use crate::change_tracker::{changed_fields, is_dirty};
use crate::identity_map::{IdentityMap, TrackedEntry};
use crate::registry::EntityRegistry;
use asupersync::combinator::retry::{self as combinator, RetryIf, RetryResult};
use asupersync::{Cx, Outcome};
use chrono::{DateTime, Utc};
use docmodel_core::{
    CREATED_ON_FIELD, ConcurrencyError, DISCRIMINATOR_FIELD, Document, Error, Filter,
    ID_FIELD, MODIFIED_ON_FIELD, MergedWriteResult, Result, StoreError, StoreSession, WriteModel,
};
use futures::future::Either;
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// Retry
// ============================================================================

/// Bounded retry for transient write conflicts.
///
/// Delays double from `base_delay`: with the defaults a write is retried
/// after 0.5s and again after 1s, then given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Retry immediately, without waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        combinator::calculate_delay(&(*self).into(), attempt, None)
    }
}

impl From<RetryPolicy> for combinator::RetryPolicy {
    fn from(policy: RetryPolicy) -> Self {
        combinator::RetryPolicy::new()
            .with_max_attempts(policy.max_attempts)
            .with_initial_delay(policy.base_delay)
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_secs(30))
            .no_jitter()
    }
}

/// Run `op` until it succeeds, fails with anything but a transient write
/// conflict, or exhausts `policy.max_attempts`.
///
/// Waits go through the runtime's timer, so a cancelled task stops retrying
/// during the delay rather than after it.
pub async fn with_retry<T, F, Fut>(cx: &Cx, policy: RetryPolicy, label: &str, mut op: F) -> Outcome<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    let mut attempt = 0u32;
    let result = combinator::retry(
        policy,
        RetryIf(|e: &Error, _attempt: u32| e.is_transient_write_conflict()),
        || {
            attempt += 1;
            if attempt > 1 {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    target: "docmodel::save",
                    collection = label,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "transient write conflict, retrying"
                );
            }
            match cx.cancel_reason() {
                Some(reason) => Either::Left(std::future::ready(Outcome::Cancelled(reason))),
                None => Either::Right(op()),
            }
        },
    )
    .await;

    match result {
        RetryResult::Ok(value) => Outcome::Ok(value),
        RetryResult::Failed(failure) => {
            if failure.final_error.is_transient_write_conflict() {
                tracing::error!(
                    target: "docmodel::save",
                    collection = label,
                    attempts = failure.attempts,
                    "transient write conflict persisted, giving up"
                );
            }
            Outcome::Err(failure.final_error)
        }
        RetryResult::Cancelled(reason) => Outcome::Cancelled(reason),
        RetryResult::Panicked(payload) => Outcome::Panicked(payload),
    }
}

// ============================================================================
// Save plan
// ============================================================================

#[derive(Debug)]
struct PlannedWrite {
    id: String,
    entry: TrackedEntry,
    document: Document,
    /// Snapshot the write was planned against, if the entity was loaded.
    snapshot: Option<Document>,
    expected_modified_on: Option<Value>,
    /// The entity had no `CreatedOn`; the document carries the resolved one.
    backfill_created: bool,
}

impl PlannedWrite {
    fn to_model(&self) -> WriteModel {
        let mut filter = Filter::id(self.id.clone());
        if let Some(expected) = &self.expected_modified_on {
            filter = filter.and(Filter::eq(MODIFIED_ON_FIELD, expected.clone()));
        }
        WriteModel::ReplaceOne {
            filter,
            replacement: self.document.clone(),
            upsert: true,
        }
    }

    fn set_created_on(&mut self, value: Value) {
        self.document.insert(CREATED_ON_FIELD.to_string(), value);
        self.backfill_created = true;
    }
}

fn has_created_on(doc: &Document) -> bool {
    doc.get(CREATED_ON_FIELD).is_some_and(|v| !v.is_null())
}

#[derive(Debug)]
struct PlannedFamily {
    root: TypeId,
    root_name: &'static str,
    collection: String,
    writes: Vec<PlannedWrite>,
}

/// The encoded working set of one `save_changes` call.
#[derive(Debug)]
pub struct SavePlan {
    families: Vec<PlannedFamily>,
    stamped_at: DateTime<Utc>,
    stamp: Value,
}

impl SavePlan {
    /// Encode every tracked entity, stamping `ModifiedOn` with `now`.
    ///
    /// An entity with no `CreatedOn` takes it from its snapshot when it was
    /// loaded; [`resolve_created_on`](Self::resolve_created_on) fills in the
    /// ones attached with a known id.
    pub fn build(registry: &EntityRegistry, identity: &IdentityMap, now: DateTime<Utc>) -> Result<Self> {
        let stamp = serde_json::to_value(now)?;
        let mut families = Vec::new();

        for root in registry.families() {
            let entries = identity.entries(root.type_id);
            if entries.is_empty() {
                continue;
            }

            let mut writes = Vec::with_capacity(entries.len());
            for (id, entry) in entries {
                let mut document = entry.encode()?;
                if root.polymorphic {
                    let info = registry.info_by_id(entry.type_id()).ok_or_else(|| {
                        Error::config(format!("tracked {} entry has an unregistered type", root.name))
                    })?;
                    document.insert(DISCRIMINATOR_FIELD.to_string(), Value::from(info.name));
                }
                document.insert(MODIFIED_ON_FIELD.to_string(), stamp.clone());

                let snapshot = identity.snapshot(root.type_id, &id);
                let mut write = PlannedWrite {
                    expected_modified_on: identity.snapshot_modified_on(root.type_id, &id),
                    snapshot,
                    id,
                    entry,
                    document,
                    backfill_created: false,
                };
                if !has_created_on(&write.document) {
                    // A snapshot is the server row: take its value, or create one now.
                    let known = write.snapshot.as_ref().map(|s| {
                        s.get(CREATED_ON_FIELD)
                            .filter(|v| !v.is_null())
                            .cloned()
                            .unwrap_or_else(|| stamp.clone())
                    });
                    if let Some(created) = known {
                        write.set_created_on(created);
                    }
                }
                writes.push(write);
            }

            families.push(PlannedFamily {
                root: root.type_id,
                root_name: root.name,
                collection: root.collection.clone(),
                writes,
            });
        }

        Ok(Self {
            families,
            stamped_at: now,
            stamp,
        })
    }

    /// Number of planned writes across all families.
    pub fn len(&self) -> usize {
        self.families.iter().map(|f| f.writes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn family_count(&self) -> usize {
        self.families.len()
    }

    /// Planned writes whose document differs from the last known server state.
    pub fn dirty_count(&self) -> usize {
        self.families
            .iter()
            .flat_map(|f| &f.writes)
            .filter(|w| is_dirty(w.snapshot.as_ref(), &w.document))
            .count()
    }

    /// Writes that still have no `CreatedOn`.
    pub fn missing_created_on(&self) -> usize {
        self.families
            .iter()
            .flat_map(|f| &f.writes)
            .filter(|w| !has_created_on(&w.document))
            .count()
    }

    /// The bulk request for family `index`, in execution order.
    pub fn models(&self, index: usize) -> Option<(&str, Vec<WriteModel>)> {
        self.families
            .get(index)
            .map(|f| (f.collection.as_str(), f.writes.iter().map(PlannedWrite::to_model).collect()))
    }

    /// Carry the server's `CreatedOn` into writes of entities attached with a
    /// known id, so the replace does not drop it.
    ///
    /// Ids with no server document are new rows and are created now.
    pub async fn resolve_created_on<S: StoreSession>(&mut self, cx: &Cx, session: &S) -> Outcome<(), Error> {
        for family in &mut self.families {
            let pending: Vec<String> = family
                .writes
                .iter()
                .filter(|w| !has_created_on(&w.document))
                .map(|w| w.id.clone())
                .collect();
            if pending.is_empty() {
                continue;
            }

            let server = match session.find(cx, &family.collection, &Filter::ids(pending)).await {
                Outcome::Ok(docs) => docs,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let mut known: HashMap<String, Value> = server
                .into_iter()
                .filter_map(|mut doc| {
                    let id = doc.get(ID_FIELD)?.as_str()?.to_string();
                    let created = doc.remove(CREATED_ON_FIELD).filter(|v| !v.is_null())?;
                    Some((id, created))
                })
                .collect();

            let mut backfilled = 0usize;
            for write in family.writes.iter_mut().filter(|w| !has_created_on(&w.document)) {
                let created = known.remove(&write.id).unwrap_or_else(|| self.stamp.clone());
                write.set_created_on(created);
                backfilled += 1;
            }
            tracing::debug!(
                target: "docmodel::save",
                collection = %family.collection,
                backfilled,
                "creation times resolved for re-attached entities"
            );
        }
        Outcome::Ok(())
    }

    /// Write every family, one unordered bulk request each, and merge the results.
    pub async fn execute<S: StoreSession>(
        &self,
        cx: &Cx,
        session: &S,
        identity: &IdentityMap,
        policy: RetryPolicy,
    ) -> Outcome<MergedWriteResult, Error> {
        let mut merged = MergedWriteResult::new();

        for (index, family) in self.families.iter().enumerate() {
            if let Some(reason) = cx.cancel_reason() {
                self.record_landed(cx, session, identity, index).await;
                return Outcome::Cancelled(reason);
            }
            tracing::debug!(
                target: "docmodel::save",
                family = family.root_name,
                collection = %family.collection,
                writes = family.writes.len(),
                "bulk upsert"
            );

            let outcome = with_retry(cx, policy, &family.collection, || {
                let models: Vec<WriteModel> = family.writes.iter().map(PlannedWrite::to_model).collect();
                session.bulk_write(cx, &family.collection, models, false)
            })
            .await;

            match outcome {
                Outcome::Ok(result) => merged += &result,
                Outcome::Err(e) => {
                    self.record_landed(cx, session, identity, index).await;
                    return Self::classify_failure(cx, session, family, e).await;
                }
                Outcome::Cancelled(r) => {
                    self.record_landed(cx, session, identity, index).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Ok(merged)
    }

    /// After a save stopped at family `failed`, record the writes that reached
    /// the server.
    ///
    /// Inside a transaction nothing landed: the caller aborts it. Otherwise
    /// every earlier family was written in full, and the failed family's
    /// documents that carry this save's stamp were written too.
    async fn record_landed<S: StoreSession>(&self, cx: &Cx, session: &S, identity: &IdentityMap, failed: usize) {
        if session.in_transaction() {
            return;
        }
        for family in &self.families[..failed] {
            self.apply_family(family, identity, |_| true);
        }
        let Some(family) = self.families.get(failed) else {
            return;
        };

        let ids = Filter::ids(family.writes.iter().map(|w| w.id.clone()));
        let server = match session.find(cx, &family.collection, &ids).await {
            Outcome::Ok(docs) => docs,
            Outcome::Err(e) => {
                tracing::warn!(
                    target: "docmodel::save",
                    collection = %family.collection,
                    error = %e,
                    "could not re-read a partially applied bulk write"
                );
                return;
            }
            Outcome::Cancelled(_) | Outcome::Panicked(_) => return,
        };
        let landed: Vec<&str> = server
            .iter()
            .filter(|doc| doc.get(MODIFIED_ON_FIELD) == Some(&self.stamp))
            .filter_map(|doc| doc.get(ID_FIELD).and_then(Value::as_str))
            .collect();
        if !landed.is_empty() {
            tracing::debug!(
                target: "docmodel::save",
                collection = %family.collection,
                landed = landed.len(),
                "recording writes of a partially applied bulk write"
            );
        }
        self.apply_family(family, identity, |w| landed.contains(&w.id.as_str()));
    }

    /// Turn a duplicate key on a version-guarded upsert into a concurrency conflict.
    async fn classify_failure<S: StoreSession>(
        cx: &Cx,
        session: &S,
        family: &PlannedFamily,
        error: Error,
    ) -> Outcome<MergedWriteResult, Error> {
        let conflicting = match &error {
            Error::Store(StoreError { id: Some(id), .. }) if error.is_duplicate_key() => family
                .writes
                .iter()
                .find(|w| &w.id == id && w.expected_modified_on.is_some()),
            _ => None,
        };
        let Some(write) = conflicting else {
            return Outcome::Err(error);
        };

        let server = match session.find(cx, &family.collection, &Filter::id(write.id.clone())).await {
            Outcome::Ok(mut docs) => docs.pop().unwrap_or_default(),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let before = write.snapshot.clone().unwrap_or_default();
        let fields = changed_fields(&before, &server);

        tracing::warn!(
            target: "docmodel::save",
            family = family.root_name,
            id = %write.id,
            fields = ?fields,
            "optimistic concurrency conflict"
        );
        Outcome::Err(Error::Concurrency(ConcurrencyError {
            entity_type: family.root_name,
            id: write.id.clone(),
            fields,
        }))
    }

    /// Record a successful save: stamp the entities and refresh their snapshots.
    pub fn apply(&self, identity: &IdentityMap) {
        for family in &self.families {
            self.apply_family(family, identity, |_| true);
        }
    }

    fn apply_family(&self, family: &PlannedFamily, identity: &IdentityMap, written: impl Fn(&PlannedWrite) -> bool) {
        for write in family.writes.iter().filter(|w| written(w)) {
            write.entry.stamp_modified(self.stamped_at);
            if write.backfill_created {
                let created = write
                    .document
                    .get(CREATED_ON_FIELD)
                    .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
                if let Some(created) = created {
                    write.entry.backfill_created(created);
                }
            }
            identity.set_snapshot(family.root, &write.id, write.document.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntityInfo;
    use asupersync::runtime::RuntimeBuilder;
    use asupersync::types::CancelKind;
    use docmodel_core::{ContextId, Entity, EntityMeta, StoreErrorKind};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Asset {
        #[serde(flatten)]
        meta: EntityMeta,
        name: String,
    }

    impl Entity for Asset {
        const DISCRIMINATOR: &'static str = "Asset";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Image {
        #[serde(flatten)]
        meta: EntityMeta,
        name: String,
        width: u32,
    }

    impl Entity for Image {
        const DISCRIMINATOR: &'static str = "Image";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    fn registry() -> EntityRegistry {
        EntityRegistry::builder()
            .family::<Asset>("assets")
            .derived::<Image, Asset>()
            .build()
            .unwrap()
    }

    fn attach<E: Entity>(map: &IdentityMap, info: &EntityInfo, mut entity: E) -> docmodel_core::EntityRef<E> {
        entity.meta_mut().assign_identity();
        map.attach(info, Arc::new(RwLock::new(entity))).unwrap()
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[test]
    fn delays_double_from_the_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(RetryPolicy::immediate(3).delay_for(2), Duration::ZERO);
    }

    #[test]
    fn retry_stops_after_max_attempts() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let attempts = AtomicU32::new(0);
        let started = std::time::Instant::now();

        let outcome: Outcome<(), Error> = rt.block_on(with_retry(
            &cx,
            RetryPolicy::new(3, Duration::from_millis(5)),
            "assets",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Outcome::Err(Error::store(
                    StoreErrorKind::TransientWriteConflict,
                    "write conflict",
                )))
            },
        ));

        assert!(matches!(outcome, Outcome::Err(ref e) if e.is_transient_write_conflict()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 5ms after the first failure, 10ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn other_errors_are_not_retried() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let attempts = AtomicU32::new(0);

        let outcome: Outcome<(), Error> = rt.block_on(with_retry(
            &cx,
            RetryPolicy::immediate(3),
            "assets",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Outcome::Err(Error::store(StoreErrorKind::Network, "reset")))
            },
        ));

        assert!(matches!(outcome, Outcome::Err(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recovers_after_transient_conflict() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let attempts = AtomicU32::new(0);

        let outcome = rt.block_on(with_retry(&cx, RetryPolicy::immediate(3), "assets", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n == 0 {
                Outcome::Err(Error::store(StoreErrorKind::TransientWriteConflict, "conflict"))
            } else {
                Outcome::Ok(n)
            })
        }));

        assert_eq!(unwrap_outcome(outcome), 1);
    }

    #[test]
    fn cancellation_stops_further_attempts() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let attempts = AtomicU32::new(0);

        let outcome: Outcome<(), Error> = rt.block_on(with_retry(
            &cx,
            RetryPolicy::immediate(3),
            "assets",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                cx.cancel_with(CancelKind::User, Some("request aborted"));
                std::future::ready(Outcome::Err(Error::store(
                    StoreErrorKind::TransientWriteConflict,
                    "write conflict",
                )))
            },
        ));

        assert!(matches!(outcome, Outcome::Cancelled(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn plan_tags_subtypes_and_guards_loaded_entities() {
        let registry = registry();
        let map = IdentityMap::new(ContextId::next());
        let asset_info = registry.info::<Asset>().unwrap();
        let image_info = registry.info::<Image>().unwrap();

        let fresh = attach(&map, asset_info, Asset {
            meta: EntityMeta::new(),
            name: "readme".to_string(),
        });
        let loaded = attach(&map, image_info, Image {
            meta: EntityMeta::with_id("img-1"),
            name: "logo".to_string(),
            width: 64,
        });
        let mut snapshot = Document::new();
        snapshot.insert("_id".to_string(), Value::from("img-1"));
        snapshot.insert(MODIFIED_ON_FIELD.to_string(), Value::from("2026-01-01T00:00:00Z"));
        map.set_snapshot(asset_info.root, "img-1", snapshot);

        let now = Utc::now();
        let plan = SavePlan::build(&registry, &map, now).unwrap();
        assert_eq!(plan.family_count(), 1);
        assert_eq!(plan.len(), 2);

        let (collection, models) = plan.models(0).unwrap();
        assert_eq!(collection, "assets");
        let fresh_id = fresh.read().unwrap().id().unwrap().to_string();
        for model in models {
            let WriteModel::ReplaceOne { filter, replacement, upsert } = model else {
                panic!("expected a replace");
            };
            assert!(upsert);
            assert!(replacement.contains_key(MODIFIED_ON_FIELD));
            if replacement.get("_id") == Some(&Value::from("img-1")) {
                assert_eq!(replacement.get(DISCRIMINATOR_FIELD), Some(&Value::from("Image")));
                assert_eq!(
                    filter,
                    Filter::id("img-1").and(Filter::eq(MODIFIED_ON_FIELD, "2026-01-01T00:00:00Z"))
                );
            } else {
                assert_eq!(replacement.get(DISCRIMINATOR_FIELD), Some(&Value::from("Asset")));
                assert_eq!(filter, Filter::id(fresh_id.clone()));
            }
        }

        plan.apply(&map);
        assert_eq!(loaded.read().unwrap().meta().modified_on(), Some(now));
        assert!(map.snapshot(asset_info.root, &fresh_id).is_some());
    }
}
