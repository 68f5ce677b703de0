//! Entity registry: the startup-built capability table for entity types.
//!
//! Every concrete entity type is registered once, either as the root of a
//! family (one physical collection) or as a subtype of an already registered
//! type. The registry resolves each type to its family root, collection,
//! discriminator, chunk collection and filter capabilities, and stores the
//! type-specialized functions the save and detach paths call on type-erased
//! tracked entries.
//!
//! # Example
//!
//! ```ignore
//! let registry = EntityRegistry::builder()
//!     .family::<Customer>("customers")
//!     .capability::<TenantScoped>()
//!     .family::<Attachment>("attachments")
//!     .with_binary_chunks("attachments.chunks", "files_id")
//!     .derived::<PdfAttachment, Attachment>()
//!     .build()?;
//! ```

use chrono::{DateTime, Utc};
use docmodel_core::{ContextId, Document, Entity, Error, Result, to_document};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Marker for a filtering concern (e.g. tenant scoping).
///
/// Entity types declare the capabilities they carry at registration; data
/// filters registered for a marker apply to every type carrying it.
pub trait Capability: Send + Sync + 'static {}

/// Type-erased tracked handle: an `Arc<RwLock<E>>` for some entity type `E`.
pub type ErasedEntity = dyn Any + Send + Sync;

pub(crate) fn read_entity<E>(lock: &RwLock<E>) -> RwLockReadGuard<'_, E> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_entity<E>(lock: &RwLock<E>) -> RwLockWriteGuard<'_, E> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Functions specialized for one concrete entity type, callable on erased handles.
#[derive(Clone, Copy)]
pub struct EntityCodec {
    /// Serialize the entity behind the handle.
    pub encode: fn(&ErasedEntity) -> Result<Document>,
    /// Record a successful persist.
    pub stamp_modified: fn(&ErasedEntity, DateTime<Utc>),
    /// Fill in a missing creation time.
    pub backfill_created: fn(&ErasedEntity, DateTime<Utc>),
    /// Bind or clear the owning unit of work.
    pub set_context: fn(&ErasedEntity, Option<ContextId>),
}

impl EntityCodec {
    pub fn of<E: Entity>() -> Self {
        Self {
            encode: encode_erased::<E>,
            stamp_modified: stamp_erased::<E>,
            backfill_created: backfill_created_erased::<E>,
            set_context: set_context_erased::<E>,
        }
    }
}

impl std::fmt::Debug for EntityCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCodec").finish_non_exhaustive()
    }
}

fn encode_erased<E: Entity>(handle: &ErasedEntity) -> Result<Document> {
    let lock = handle.downcast_ref::<RwLock<E>>().ok_or_else(|| {
        Error::config(format!(
            "tracked handle is not a {}",
            std::any::type_name::<E>()
        ))
    })?;
    to_document(&*read_entity(lock))
}

fn stamp_erased<E: Entity>(handle: &ErasedEntity, at: DateTime<Utc>) {
    if let Some(lock) = handle.downcast_ref::<RwLock<E>>() {
        write_entity(lock).meta_mut().set_modified_on(at);
    }
}

fn backfill_created_erased<E: Entity>(handle: &ErasedEntity, at: DateTime<Utc>) {
    if let Some(lock) = handle.downcast_ref::<RwLock<E>>() {
        write_entity(lock).meta_mut().backfill_created_on(at);
    }
}

fn set_context_erased<E: Entity>(handle: &ErasedEntity, context: Option<ContextId>) {
    if let Some(lock) = handle.downcast_ref::<RwLock<E>>() {
        write_entity(lock).meta_mut().set_context(context);
    }
}

/// The binary-chunk collection associated with a binary-content family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCollection {
    pub collection: String,
    /// Field in each chunk holding the owning document's id.
    pub owner_field: String,
}

/// Registered metadata for one concrete entity type.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub type_id: TypeId,
    /// Discriminator of this type; also its display name.
    pub name: &'static str,
    pub parent: Option<TypeId>,
    pub root: TypeId,
    pub root_name: &'static str,
    /// Physical collection shared by the whole family.
    pub collection: String,
    /// Set when this type is or derives from a binary-content family.
    pub chunks: Option<ChunkCollection>,
    /// Does the family hold more than one registered type?
    pub polymorphic: bool,
    /// Discriminators of this type and every registered subtype below it.
    pub discriminators: Vec<&'static str>,
    pub capabilities: Vec<TypeId>,
    pub codec: EntityCodec,
}

impl EntityInfo {
    pub fn is_root(&self) -> bool {
        self.type_id == self.root
    }

    pub fn has_capability(&self, marker: TypeId) -> bool {
        self.capabilities.contains(&marker)
    }
}

struct Registration {
    type_id: TypeId,
    name: &'static str,
    parent: Option<TypeId>,
    collection: Option<String>,
    chunks: Option<ChunkCollection>,
    capabilities: Vec<TypeId>,
    codec: EntityCodec,
}

/// Builder for [`EntityRegistry`].
#[derive(Default)]
pub struct EntityRegistryBuilder {
    registrations: Vec<Registration>,
    error: Option<Error>,
}

impl EntityRegistryBuilder {
    /// Register `E` as the root of a family stored in `collection`.
    #[must_use]
    pub fn family<E: Entity>(mut self, collection: impl Into<String>) -> Self {
        self.push(Registration {
            type_id: TypeId::of::<E>(),
            name: E::DISCRIMINATOR,
            parent: None,
            collection: Some(collection.into()),
            chunks: None,
            capabilities: Vec::new(),
            codec: EntityCodec::of::<E>(),
        });
        self
    }

    /// Register `E` as a subtype of the already registered `P`.
    #[must_use]
    pub fn derived<E: Entity, P: Entity>(mut self) -> Self {
        let parent = TypeId::of::<P>();
        if !self.registrations.iter().any(|r| r.type_id == parent) {
            self.fail(format!(
                "{} derives from {}, which is not registered",
                E::DISCRIMINATOR,
                P::DISCRIMINATOR
            ));
            return self;
        }
        self.push(Registration {
            type_id: TypeId::of::<E>(),
            name: E::DISCRIMINATOR,
            parent: Some(parent),
            collection: None,
            chunks: None,
            capabilities: Vec::new(),
            codec: EntityCodec::of::<E>(),
        });
        self
    }

    /// Mark the last registered type as binary-content bearing.
    #[must_use]
    pub fn with_binary_chunks(
        mut self,
        collection: impl Into<String>,
        owner_field: impl Into<String>,
    ) -> Self {
        let chunks = ChunkCollection {
            collection: collection.into(),
            owner_field: owner_field.into(),
        };
        match self.registrations.last_mut() {
            Some(last) => last.chunks = Some(chunks),
            None => self.fail("with_binary_chunks called before any type was registered"),
        }
        self
    }

    /// Declare that the last registered type carries capability `M`.
    #[must_use]
    pub fn capability<M: Capability>(mut self) -> Self {
        match self.registrations.last_mut() {
            Some(last) => {
                let marker = TypeId::of::<M>();
                if !last.capabilities.contains(&marker) {
                    last.capabilities.push(marker);
                }
            }
            None => self.fail("capability called before any type was registered"),
        }
        self
    }

    pub fn build(self) -> Result<EntityRegistry> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let by_id: HashMap<TypeId, &Registration> =
            self.registrations.iter().map(|r| (r.type_id, r)).collect();

        let ancestors = |r: &Registration| {
            let mut chain = vec![r.type_id];
            let mut current = r.parent;
            while let Some(id) = current {
                chain.push(id);
                current = by_id.get(&id).and_then(|p| p.parent);
            }
            chain
        };

        let mut infos = HashMap::new();
        let mut families = Vec::new();
        for r in &self.registrations {
            let chain = ancestors(r);
            let root_id = *chain.last().unwrap_or(&r.type_id);
            let Some(root) = by_id.get(&root_id) else {
                return Err(Error::config(format!("{} has no registered root", r.name)));
            };
            let collection = root.collection.clone().unwrap_or_default();

            let chunks = chain
                .iter()
                .find_map(|id| by_id.get(id).and_then(|a| a.chunks.clone()));

            let mut capabilities = Vec::new();
            for id in &chain {
                if let Some(a) = by_id.get(id) {
                    for marker in &a.capabilities {
                        if !capabilities.contains(marker) {
                            capabilities.push(*marker);
                        }
                    }
                }
            }

            let mut discriminators = vec![r.name];
            for other in &self.registrations {
                if other.type_id != r.type_id && ancestors(other).contains(&r.type_id) {
                    discriminators.push(other.name);
                }
            }

            let polymorphic = self
                .registrations
                .iter()
                .filter(|other| ancestors(other).last() == Some(&root_id))
                .count()
                > 1;

            if r.parent.is_none() {
                families.push(r.type_id);
            }
            infos.insert(
                r.type_id,
                EntityInfo {
                    type_id: r.type_id,
                    name: r.name,
                    parent: r.parent,
                    root: root_id,
                    root_name: root.name,
                    collection,
                    chunks,
                    polymorphic,
                    discriminators,
                    capabilities,
                    codec: r.codec,
                },
            );
        }

        Ok(EntityRegistry { infos, families })
    }

    fn push(&mut self, registration: Registration) {
        if self
            .registrations
            .iter()
            .any(|r| r.type_id == registration.type_id)
        {
            self.fail(format!("{} is registered twice", registration.name));
            return;
        }
        self.registrations.push(registration);
    }

    fn fail(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(Error::config(message));
        }
    }
}

/// Maps concrete entity types to their family metadata.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    infos: HashMap<TypeId, EntityInfo>,
    /// Family roots in registration order; saves visit families in this order.
    families: Vec<TypeId>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    /// Metadata for `E`, or a configuration error if `E` was never registered.
    pub fn info<E: Entity>(&self) -> Result<&EntityInfo> {
        self.infos.get(&TypeId::of::<E>()).ok_or_else(|| {
            Error::config(format!(
                "entity type {} is not registered",
                std::any::type_name::<E>()
            ))
        })
    }

    pub fn info_by_id(&self, type_id: TypeId) -> Option<&EntityInfo> {
        self.infos.get(&type_id)
    }

    /// Root metadata of each family, in registration order.
    pub fn families(&self) -> impl Iterator<Item = &EntityInfo> {
        self.families.iter().filter_map(|id| self.infos.get(id))
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}
