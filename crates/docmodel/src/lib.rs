//! DocModel Rust - a unit of work over document databases.
//!
//! DocModel tracks entities per request, writes them back in bulk, and keeps
//! deletes, lazy relations and query filters consistent with one server
//! session:
//!
//! - Identity map with one tracked instance per id and a snapshot of its
//!   server state
//! - `save_changes` as one unordered bulk upsert per entity family, retried on
//!   transient write conflicts and guarded by optimistic concurrency
//! - Cascading deletes that also remove binary chunks
//! - Lazy one/many relations with batch loading
//! - Pluggable data filters (tenant scoping, soft delete) with scoped suspension
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Order {
//!     #[serde(flatten)]
//!     meta: EntityMeta,
//!     status: String,
//! }
//!
//! impl Entity for Order {
//!     const DISCRIMINATOR: &'static str = "Order";
//!     fn meta(&self) -> &EntityMeta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut EntityMeta { &mut self.meta }
//! }
//!
//! async fn place(cx: &Cx, factory: &UnitOfWorkFactory<MemoryStore>) -> Outcome<(), Error> {
//!     let Outcome::Ok(uow) = factory.open(cx).await else { todo!() };
//!     if let Err(e) = uow.attach(Order { meta: EntityMeta::new(), status: "new".into() }) {
//!         return Outcome::Err(e);
//!     }
//!     let outcome = uow.save_changes(cx).await;
//!     uow.dispose(cx).await;
//!     outcome.map(|_| ())
//! }
//! ```

pub use docmodel_core::{
    BulkWriteResult, CREATED_ON_FIELD, ConcurrencyError, ConfigError, ContextId,
    DISCRIMINATOR_FIELD, Document, DocumentStore, Entity, EntityMeta, EntityRef, Error,
    Filter, ID_FIELD, IdCursor, LazyMany, LazyOne, MODIFIED_ON_FIELD, MergedWriteResult,
    ReadConcern, ReadPreference, RelationCache, RelationSource, Result, ServiceMap,
    ServiceResolver, SessionOptions, SourceFuture, StoreError, StoreErrorKind, StoreSession,
    TransactionError, TransactionErrorKind, TransactionOptions, WriteConcern, WriteModel,
    document_id, from_document, new_id, to_document,
};

pub use docmodel_session::{
    Capability, ChunkCollection, ContextDirectory, DataFilter, DeleteRequest, EntityInfo,
    EntityRegistry, EntityRegistryBuilder, FilterRegistry, FilterSuspension, IdentityMap,
    N1DetectionScope, N1QueryTracker, N1Stats, RetryPolicy, SaveEventCallbacks, UnitOfWork,
    UnitOfWorkConfig, UnitOfWorkFactory,
};

pub use docmodel_memory::{DeleteCall, MemoryCursor, MemorySession, MemoryStore, StoreStats};

// Re-export asupersync types for convenience
pub use docmodel_core::{Budget, Cx, Outcome, RegionId, TaskId};

/// Lower-level building blocks.
pub mod session {
    pub use docmodel_session::{
        cascade, change_tracker, filters, flush, identity_map, n1_detection, registry,
        unit_of_work,
    };
}

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Entities
        Entity,
        EntityMeta,
        EntityRef,
        EntityRegistry,
        Error,
        Filter,
        LazyMany,
        LazyOne,
        Result,
        // Unit of work
        Capability,
        DataFilter,
        MergedWriteResult,
        ServiceMap,
        ServiceResolver,
        UnitOfWork,
        UnitOfWorkConfig,
        UnitOfWorkFactory,
        // In-process store
        MemoryStore,
    };
    pub use serde::{Deserialize, Serialize};
}
