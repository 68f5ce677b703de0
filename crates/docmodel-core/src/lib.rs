//! Core types and traits for DocModel Rust.
//!
//! `docmodel-core` is the **foundation layer** for the entire ecosystem. It defines the
//! contracts that the unit of work and the store drivers implement.
//!
//! # Role In The Architecture
//!
//! - **Entity contract**: [`Entity`] and [`EntityMeta`] describe persisted documents
//!   and their system-managed fields.
//! - **Filter language**: [`Filter`] is the predicate tree shared by queries, counts,
//!   deletes and in-memory post-filters.
//! - **Store contract**: [`DocumentStore`] and [`StoreSession`] are what drivers implement.
//! - **Lazy relations**: [`LazyOne`] and [`LazyMany`] with owner batching.
//! - **Errors**: [`Error`] is the shared error type across the stack.
//! - **Async runtime**: re-exports `Cx` and `Outcome` from asupersync.

pub mod document;
pub mod entity;
pub mod error;
pub mod filter;
pub mod options;
pub mod relation;
pub mod result;
pub mod services;
pub mod store;

pub use document::{
    CREATED_ON_FIELD, DISCRIMINATOR_FIELD, Document, ID_FIELD, MODIFIED_ON_FIELD, document_id,
    from_document, to_document,
};
pub use entity::{ContextId, Entity, EntityMeta, EntityRef, new_id};
pub use error::{
    ConcurrencyError, ConfigError, Error, Result, StoreError, StoreErrorKind, TransactionError,
    TransactionErrorKind,
};
pub use filter::{Filter, Pattern};
pub use options::{ReadConcern, ReadPreference, SessionOptions, TransactionOptions, WriteConcern};
pub use relation::{LazyMany, LazyOne, RelationCache, RelationSource, SourceFuture};
pub use result::{BulkWriteResult, MergedWriteResult};
pub use services::{ServiceMap, ServiceResolver};
pub use store::{DocumentStore, IdCursor, StoreSession, WriteModel};

// Re-export asupersync types for convenience
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};
