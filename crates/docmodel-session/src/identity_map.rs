//! Identity Map: one tracked instance per entity id, per unit of work.
//!
//! The map holds two tables, both keyed by the entity's *family root* type and
//! then by id:
//!
//! - the **working set**: the live `Arc<RwLock<E>>` handles application code mutates
//! - the **snapshot set**: the last known server-confirmed document for each id
//!
//! Attaching an id that is already tracked returns the existing handle; the
//! new object is discarded. Both tables live behind one lock so that detach
//! removes an entry from both and clears the entity's owner association in
//! one step.
//!
//! # Example
//!
//! ```ignore
//! let map = IdentityMap::new(ContextId::next());
//! let a = map.attach(info, Arc::new(RwLock::new(order)))?;
//! let b = map.attach(info, Arc::new(RwLock::new(same_id_order)))?;
//! assert!(Arc::ptr_eq(&a, &b));
//! ```

use crate::change_tracker::SnapshotSet;
use crate::registry::{EntityCodec, EntityInfo, ErasedEntity, read_entity};
use docmodel_core::{ContextId, Document, Entity, EntityRef, Error, Result};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

/// A type-erased entry in the working set.
#[derive(Clone)]
pub struct TrackedEntry {
    /// Actually stores `Arc<RwLock<E>>` for some E.
    handle: Arc<ErasedEntity>,
    /// Concrete type of E.
    type_id: TypeId,
    codec: EntityCodec,
}

impl TrackedEntry {
    fn new<E: Entity>(handle: EntityRef<E>, codec: EntityCodec) -> Self {
        Self {
            handle: handle as Arc<ErasedEntity>,
            type_id: TypeId::of::<E>(),
            codec,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Serialize the tracked entity.
    pub fn encode(&self) -> Result<Document> {
        (self.codec.encode)(&*self.handle)
    }

    pub fn stamp_modified(&self, at: chrono::DateTime<chrono::Utc>) {
        (self.codec.stamp_modified)(&*self.handle, at);
    }

    pub fn backfill_created(&self, at: chrono::DateTime<chrono::Utc>) {
        (self.codec.backfill_created)(&*self.handle, at);
    }

    fn release(&self) {
        (self.codec.set_context)(&*self.handle, None);
    }

    fn downcast<E: Entity>(&self) -> Option<EntityRef<E>> {
        Arc::clone(&self.handle).downcast::<RwLock<E>>().ok()
    }

    fn is_handle<E: Entity>(&self, handle: &EntityRef<E>) -> bool {
        let ours: &dyn Any = &*self.handle;
        ours.downcast_ref::<RwLock<E>>()
            .is_some_and(|lock| std::ptr::eq(lock, &**handle))
    }
}

impl std::fmt::Debug for TrackedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntry")
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Tables {
    working: HashMap<TypeId, BTreeMap<String, TrackedEntry>>,
    snapshots: SnapshotSet,
}

/// Per-unit-of-work dual cache of tracked entities.
pub struct IdentityMap {
    owner: ContextId,
    tables: Mutex<Tables>,
}

impl IdentityMap {
    pub fn new(owner: ContextId) -> Self {
        Self {
            owner,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn owner(&self) -> ContextId {
        self.owner
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Track `handle`, or return the handle already tracked for its id.
    ///
    /// The entity must already carry an id. A new entry's owner association
    /// is bound to this map's owner.
    pub fn attach<E: Entity>(&self, info: &EntityInfo, handle: EntityRef<E>) -> Result<EntityRef<E>> {
        let id = read_entity(&handle)
            .id()
            .map(str::to_string)
            .ok_or_else(|| Error::Argument(format!("cannot track a {} without an id", info.name)))?;

        let mut tables = self.lock();
        let family = tables.working.entry(info.root).or_default();
        if let Some(existing) = family.get(&id) {
            return existing.downcast::<E>().ok_or_else(|| {
                Error::Argument(format!(
                    "id {} is already tracked in family {} as a different type than {}",
                    id, info.root_name, info.name
                ))
            });
        }

        let entry = TrackedEntry::new(Arc::clone(&handle), info.codec);
        (entry.codec.set_context)(&*entry.handle, Some(self.owner));
        family.insert(id, entry);
        Ok(handle)
    }

    /// The handle tracked for `id`, if it is tracked as `E`.
    pub fn get<E: Entity>(&self, root: TypeId, id: &str) -> Option<EntityRef<E>> {
        self.lock()
            .working
            .get(&root)
            .and_then(|f| f.get(id))
            .and_then(TrackedEntry::downcast::<E>)
    }

    pub fn contains(&self, root: TypeId, id: &str) -> bool {
        self.lock()
            .working
            .get(&root)
            .is_some_and(|f| f.contains_key(id))
    }

    /// Remove `id` from both tables and clear the entity's owner association.
    pub fn detach(&self, root: TypeId, id: &str) -> bool {
        let mut tables = self.lock();
        tables.snapshots.remove(root, id);
        let removed = tables.working.get_mut(&root).and_then(|f| f.remove(id));
        match removed {
            Some(entry) => {
                entry.release();
                true
            }
            None => false,
        }
    }

    /// Remove `id` only if it is tracked by exactly this handle.
    pub fn detach_handle<E: Entity>(&self, root: TypeId, id: &str, handle: &EntityRef<E>) -> bool {
        let mut tables = self.lock();
        let tracked = tables
            .working
            .get(&root)
            .and_then(|f| f.get(id))
            .is_some_and(|entry| entry.is_handle(handle));
        if !tracked {
            return false;
        }
        tables.snapshots.remove(root, id);
        if let Some(entry) = tables.working.get_mut(&root).and_then(|f| f.remove(id)) {
            entry.release();
        }
        true
    }

    /// Remove many ids of one family from both tables.
    pub fn detach_many(&self, root: TypeId, ids: &[String]) -> usize {
        let mut tables = self.lock();
        let mut removed = 0;
        for id in ids {
            tables.snapshots.remove(root, id);
            if let Some(entry) = tables.working.get_mut(&root).and_then(|f| f.remove(id)) {
                entry.release();
                removed += 1;
            }
        }
        removed
    }

    /// Working-set entries of one family, in id order.
    pub fn entries(&self, root: TypeId) -> Vec<(String, TrackedEntry)> {
        self.lock()
            .working
            .get(&root)
            .map(|f| f.iter().map(|(id, e)| (id.clone(), e.clone())).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, root: TypeId, id: &str) -> Option<Document> {
        self.lock().snapshots.get(root, id).cloned()
    }

    /// The snapshot's `ModifiedOn` value, if one was recorded.
    pub fn snapshot_modified_on(&self, root: TypeId, id: &str) -> Option<serde_json::Value> {
        self.lock().snapshots.modified_on(root, id).cloned()
    }

    pub fn set_snapshot(&self, root: TypeId, id: &str, doc: Document) {
        self.lock().snapshots.insert(root, id, doc);
    }

    /// Record a snapshot only if none exists yet.
    pub fn set_snapshot_if_absent(&self, root: TypeId, id: &str, doc: Document) {
        let mut tables = self.lock();
        if tables.snapshots.get(root, id).is_none() {
            tables.snapshots.insert(root, id, doc);
        }
    }

    /// Number of tracked entities across all families.
    pub fn len(&self) -> usize {
        self.lock().working.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot_len(&self) -> usize {
        self.lock().snapshots.len()
    }

    /// Empty both tables, releasing every tracked entity.
    pub fn clear(&self) {
        let mut tables = self.lock();
        for family in tables.working.values() {
            for entry in family.values() {
                entry.release();
            }
        }
        tables.working.clear();
        tables.snapshots.clear();
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("owner", &self.owner)
            .field("tracked", &self.len())
            .field("snapshots", &self.snapshot_len())
            .finish()
    }
}

/// Directory of live identity maps, used to move a handle between units of work.
///
/// Holds weak references only; a unit of work unregisters itself when disposed.
#[derive(Debug, Clone, Default)]
pub struct ContextDirectory {
    maps: Arc<Mutex<HashMap<ContextId, Weak<IdentityMap>>>>,
}

impl ContextDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextId, Weak<IdentityMap>>> {
        match self.maps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, map: &Arc<IdentityMap>) {
        let mut maps = self.lock();
        maps.retain(|_, weak| weak.strong_count() > 0);
        maps.insert(map.owner(), Arc::downgrade(map));
    }

    pub fn unregister(&self, owner: ContextId) {
        self.lock().remove(&owner);
    }

    pub fn lookup(&self, owner: ContextId) -> Option<Arc<IdentityMap>> {
        self.lock().get(&owner).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
