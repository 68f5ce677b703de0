//! Document store traits.
//!
//! This module defines the abstractions the unit of work talks to:
//!
//! - [`DocumentStore`] - Opens server sessions and reports topology capabilities
//! - [`StoreSession`] - One causally consistent session: transactions, reads, bulk writes
//! - [`IdCursor`] - Batched stream of matching document ids
//! - [`WriteModel`] - A single operation inside a bulk write
//!
//! All operations integrate with asupersync's structured concurrency via `Cx` context
//! for proper cancellation and timeout handling.

use crate::document::Document;
use crate::error::Result;
use crate::filter::Filter;
use crate::options::{SessionOptions, TransactionOptions};
use crate::result::BulkWriteResult;
use asupersync::{Cx, Outcome};

/// A single operation inside a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    /// Replace the document matching `filter`; insert `replacement` if none matches and `upsert` is set.
    ReplaceOne {
        filter: Filter,
        replacement: Document,
        upsert: bool,
    },
}

/// A connected document database.
pub trait DocumentStore: Send + Sync {
    /// Session type produced by this store.
    type Session: StoreSession;

    /// Does the connected topology support multi-document transactions?
    fn supports_transactions(&self) -> bool;

    /// Start a new server session.
    fn start_session(
        &self,
        cx: &Cx,
        options: &SessionOptions,
    ) -> impl Future<Output = Outcome<Self::Session, crate::Error>> + Send;
}

/// One server session.
///
/// All methods take `&self`: implementations keep their mutable state behind
/// interior locks so that independent sub-operations can run concurrently.
pub trait StoreSession: Send + Sync {
    /// Cursor type returned by [`StoreSession::find_ids`].
    type Cursor: IdCursor;

    /// Is a transaction currently open on this session?
    fn in_transaction(&self) -> bool;

    /// Open a transaction. This is local bookkeeping; the server learns about it
    /// with the first operation.
    fn start_transaction(&self, options: &TransactionOptions) -> Result<()>;

    /// Commit the open transaction.
    fn commit_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Abort the open transaction, discarding its writes.
    fn abort_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Fetch every document of `collection` matching `filter`.
    fn find(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<Vec<Document>, crate::Error>> + Send;

    /// Count documents of `collection` matching `filter`.
    fn count(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Open a cursor over the ids of matching documents, `batch_size` ids per batch.
    fn find_ids(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
        batch_size: usize,
    ) -> impl Future<Output = Outcome<Self::Cursor, crate::Error>> + Send;

    /// Execute a bulk write.
    ///
    /// With `ordered` unset the store may apply operations in any order and
    /// continue past individual failures.
    fn bulk_write(
        &self,
        cx: &Cx,
        collection: &str,
        operations: Vec<WriteModel>,
        ordered: bool,
    ) -> impl Future<Output = Outcome<BulkWriteResult, crate::Error>> + Send;

    /// Delete every document matching `filter`, returning the deleted count.
    fn delete_many(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;
}

/// A batched stream of document ids.
pub trait IdCursor: Send {
    /// Next batch of ids, or `None` once exhausted.
    fn next_batch(
        &mut self,
        cx: &Cx,
    ) -> impl Future<Output = Outcome<Option<Vec<String>>, crate::Error>> + Send;
}
