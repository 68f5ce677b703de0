//! Entity trait and system-managed metadata.
//!
//! Every persisted type embeds an [`EntityMeta`] (usually with
//! `#[serde(flatten)]`) and implements [`Entity`] to expose it.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Order {
//!     #[serde(flatten)]
//!     meta: EntityMeta,
//!     customer_id: String,
//!     total: i64,
//! }
//!
//! impl Entity for Order {
//!     const DISCRIMINATOR: &'static str = "Order";
//!     fn meta(&self) -> &EntityMeta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut EntityMeta { &mut self.meta }
//! }
//! ```

use crate::relation::RelationCache;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Shared handle to a tracked entity.
///
/// The unit of work that tracks an entity keeps one handle per id; every
/// handle it returns for that id points at the same lock.
pub type EntityRef<E> = Arc<RwLock<E>>;

/// Non-owning association between an entity and the unit of work tracking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh, process-unique context id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uow#{}", self.0)
    }
}

/// Generate a new entity id: a time-ordered UUIDv7 in simple hex form.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// System-managed fields carried by every entity.
#[derive(Default, Serialize, Deserialize)]
pub struct EntityMeta {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "CreatedOn", default, skip_serializing_if = "Option::is_none")]
    created_on: Option<DateTime<Utc>>,
    #[serde(rename = "ModifiedOn", default, skip_serializing_if = "Option::is_none")]
    modified_on: Option<DateTime<Utc>>,
    #[serde(skip)]
    context: Option<ContextId>,
    #[serde(skip)]
    relations: RelationCache,
}

impl EntityMeta {
    /// Metadata for a new entity; id and creation time are assigned at attach.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for an entity whose id is already known (e.g. it exists server-side).
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn created_on(&self) -> Option<DateTime<Utc>> {
        self.created_on
    }

    pub fn modified_on(&self) -> Option<DateTime<Utc>> {
        self.modified_on
    }

    /// The unit of work currently tracking this entity, if any.
    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    /// Lazy relation descriptors configured on this instance.
    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    /// Assign id and creation time if the entity has no id yet.
    ///
    /// Returns `true` if an identity was assigned. An existing id is never replaced.
    pub fn assign_identity(&mut self) -> bool {
        if self.id.is_some() {
            return false;
        }
        self.id = Some(new_id());
        self.created_on = Some(Utc::now());
        true
    }

    /// Fill in the creation time of an entity attached with a known id.
    ///
    /// An existing creation time is never replaced.
    pub fn backfill_created_on(&mut self, at: DateTime<Utc>) {
        self.created_on.get_or_insert(at);
    }

    /// Record a successful persist.
    pub fn set_modified_on(&mut self, at: DateTime<Utc>) {
        self.modified_on = Some(at);
    }

    /// Bind or clear the owning unit of work.
    pub fn set_context(&mut self, context: Option<ContextId>) {
        self.context = context;
    }
}

impl Clone for EntityMeta {
    /// A clone carries the persisted fields only: it is not tracked and has
    /// no resolved relations.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            created_on: self.created_on,
            modified_on: self.modified_on,
            context: None,
            relations: RelationCache::default(),
        }
    }
}

impl PartialEq for EntityMeta {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.created_on == other.created_on
            && self.modified_on == other.modified_on
    }
}

impl fmt::Debug for EntityMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMeta")
            .field("id", &self.id)
            .field("created_on", &self.created_on)
            .field("modified_on", &self.modified_on)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Trait for persisted document types.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator stored in `_t` when a family holds more than one type.
    /// Also used as the entity name in errors and logs.
    const DISCRIMINATOR: &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> Option<&str> {
        self.meta().id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        #[serde(flatten)]
        meta: EntityMeta,
        name: String,
    }

    impl Entity for Widget {
        const DISCRIMINATOR: &'static str = "Widget";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    #[test]
    fn identity_assigned_once() {
        let mut meta = EntityMeta::new();
        assert!(meta.assign_identity());
        let id = meta.id().unwrap().to_string();
        let created = meta.created_on();
        assert!(!id.is_empty());
        assert!(created.is_some());

        assert!(!meta.assign_identity());
        assert_eq!(meta.id(), Some(id.as_str()));
        assert_eq!(meta.created_on(), created);
    }

    #[test]
    fn known_id_is_kept() {
        let mut meta = EntityMeta::with_id("fixed");
        assert!(!meta.assign_identity());
        assert_eq!(meta.id(), Some("fixed"));
        assert!(meta.created_on().is_none());
    }

    #[test]
    fn backfilled_creation_time_is_set_once() {
        let mut meta = EntityMeta::with_id("fixed");
        let first = Utc::now();
        meta.backfill_created_on(first);
        meta.backfill_created_on(first + chrono::Duration::seconds(5));
        assert_eq!(meta.created_on(), Some(first));
    }

    #[test]
    fn ids_are_time_ordered() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 32);
        assert!(a < b);
    }

    #[test]
    fn clone_drops_context() {
        let mut meta = EntityMeta::with_id("x");
        meta.set_context(Some(ContextId::next()));
        let copy = meta.clone();
        assert!(copy.context().is_none());
        assert_eq!(copy, meta);
    }

    #[test]
    fn flattened_meta_serializes_system_fields() {
        let mut w = Widget {
            meta: EntityMeta::new(),
            name: "bolt".to_string(),
        };
        w.meta_mut().assign_identity();
        w.meta_mut().set_context(Some(ContextId::next()));

        let json = serde_json::to_value(&w).unwrap();
        assert!(json.get("_id").is_some());
        assert!(json.get("CreatedOn").is_some());
        assert!(json.get("ModifiedOn").is_none());
        assert!(json.get("context").is_none());

        let back: Widget = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), w.id());
        assert_eq!(back.meta().created_on(), w.meta().created_on());
    }

    #[test]
    fn context_ids_are_unique() {
        assert_ne!(ContextId::next(), ContextId::next());
    }
}
