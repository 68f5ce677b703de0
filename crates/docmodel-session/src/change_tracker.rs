//! Snapshot table: the last known server-confirmed state of tracked entities.
//!
//! The identity map keeps one of these next to its working set. Snapshots are
//! stored as documents so that comparisons do not depend on the entity type.

use docmodel_core::{Document, MODIFIED_ON_FIELD};
use serde_json::Value;
use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};

/// Root type -> (id -> last known server document).
#[derive(Debug, Default, Clone)]
pub struct SnapshotSet {
    families: HashMap<TypeId, HashMap<String, Document>>,
}

impl SnapshotSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, root: TypeId, id: &str) -> Option<&Document> {
        self.families.get(&root).and_then(|f| f.get(id))
    }

    pub fn insert(&mut self, root: TypeId, id: impl Into<String>, doc: Document) {
        self.families.entry(root).or_default().insert(id.into(), doc);
    }

    pub fn remove(&mut self, root: TypeId, id: &str) -> Option<Document> {
        self.families.get_mut(&root).and_then(|f| f.remove(id))
    }

    /// `ModifiedOn` recorded in the snapshot, used as the optimistic-concurrency token.
    pub fn modified_on(&self, root: TypeId, id: &str) -> Option<&Value> {
        self.get(root, id)
            .and_then(|doc| doc.get(MODIFIED_ON_FIELD))
            .filter(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.families.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.families.clear();
    }
}

/// Top-level fields whose values differ between two documents.
///
/// `ModifiedOn` is ignored: it changes on every persist and is not a
/// user-visible conflict. Fields are returned sorted.
pub fn changed_fields(before: &Document, after: &Document) -> Vec<String> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|k| k.as_str() != MODIFIED_ON_FIELD)
        .filter(|k| before.get(k.as_str()) != after.get(k.as_str()))
        .cloned()
        .collect()
}

/// Does `current` differ from `snapshot` in any field other than `ModifiedOn`?
pub fn is_dirty(snapshot: Option<&Document>, current: &Document) -> bool {
    match snapshot {
        Some(snapshot) => !changed_fields(snapshot, current).is_empty(),
        None => true,
    }
}
