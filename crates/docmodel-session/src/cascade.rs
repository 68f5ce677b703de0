//! Cascading delete engine.
//!
//! Deletes always target the family root's collection. One cascading batch:
//!
//! 1. drops the ids from the identity map (working set and snapshots)
//! 2. deletes them from the primary collection
//! 3. for binary-content families, concurrently deletes their chunks by owner id
//!
//! Id sets larger than the batch size are split into sequential batches.
//! Predicate deletes stream matching ids through a batched cursor instead of
//! materializing the match set.

use crate::identity_map::IdentityMap;
use crate::registry::EntityInfo;
use asupersync::{Cx, Outcome};
use docmodel_core::{DISCRIMINATOR_FIELD, Error, Filter, IdCursor, Result, StoreSession};

/// Whether a delete observes cancellation once it has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationMode {
    /// Checked between batches.
    Honored,
    /// The delete runs to completion.
    Ignored,
}

/// Decide how a delete treats cancellation.
///
/// Inside a transaction, or when only one collection is touched, cancellation
/// is honored. A multi-collection delete outside a transaction cannot be
/// rolled back halfway, so it refuses a cancellable request (or one whose
/// cancellation is already pending) and otherwise runs to completion.
pub fn cancellation_mode(
    cancellable: bool,
    cancel_requested: bool,
    in_transaction: bool,
    multi_collection: bool,
) -> Result<CancellationMode> {
    if in_transaction || !multi_collection {
        return Ok(CancellationMode::Honored);
    }
    if cancellable || cancel_requested {
        return Err(Error::UnsupportedCancellation(
            "cascading deletes across collections can only be cancelled inside a transaction"
                .to_string(),
        ));
    }
    Ok(CancellationMode::Ignored)
}

/// One cascading delete against a family.
pub struct CascadeDelete<'a, S: StoreSession> {
    session: &'a S,
    identity: &'a IdentityMap,
    info: &'a EntityInfo,
    batch_size: usize,
    mode: CancellationMode,
}

impl<'a, S: StoreSession> CascadeDelete<'a, S> {
    pub fn new(
        session: &'a S,
        identity: &'a IdentityMap,
        info: &'a EntityInfo,
        batch_size: usize,
        mode: CancellationMode,
    ) -> Self {
        Self {
            session,
            identity,
            info,
            batch_size: batch_size.max(1),
            mode,
        }
    }

    /// Does this delete touch more than the primary collection?
    pub fn is_multi_collection(info: &EntityInfo) -> bool {
        info.chunks.is_some()
    }

    fn honors_cancellation(&self) -> bool {
        self.mode == CancellationMode::Honored
    }

    /// Restrict `filter` to this type's rows when it is a subtype in a shared collection.
    pub fn scoped(&self, filter: Filter) -> Filter {
        if self.info.is_root() {
            return filter;
        }
        filter.and(Filter::in_list(
            DISCRIMINATOR_FIELD,
            self.info.discriminators.iter().copied(),
        ))
    }

    /// Delete one batch of ids, returning the primary collection's deleted count.
    #[tracing::instrument(level = "debug", skip(self, cx, ids), fields(family = self.info.root_name, ids = ids.len()))]
    pub async fn delete_batch(&self, cx: &Cx, ids: &[String]) -> Outcome<u64, Error> {
        if ids.is_empty() {
            return Outcome::Ok(0);
        }
        let detached = self.identity.detach_many(self.info.root, ids);
        let primary_filter = Filter::ids(ids.iter().cloned());
        let primary = self
            .session
            .delete_many(cx, &self.info.collection, &primary_filter);

        let deleted = match &self.info.chunks {
            None => match primary.await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            },
            Some(chunks) => {
                let chunk_filter = Filter::in_list(chunks.owner_field.as_str(), ids.iter().cloned());
                let chunk = self
                    .session
                    .delete_many(cx, &chunks.collection, &chunk_filter);
                let (primary, chunk) = futures::future::join(primary, chunk).await;
                let chunks_deleted = match chunk {
                    Outcome::Ok(n) => n,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                tracing::debug!(
                    target: "docmodel::delete",
                    collection = %chunks.collection,
                    deleted = chunks_deleted,
                    "chunks deleted"
                );
                match primary {
                    Outcome::Ok(n) => n,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        };

        tracing::debug!(
            target: "docmodel::delete",
            collection = %self.info.collection,
            detached,
            deleted,
            "delete batch complete"
        );
        Outcome::Ok(deleted)
    }

    /// Delete an explicit id set, in sequential batches of the batch size.
    pub async fn delete_ids(&self, cx: &Cx, ids: &[String]) -> Outcome<u64, Error> {
        if ids.len() <= self.batch_size {
            return self.delete_batch(cx, ids).await;
        }

        let mut total = 0;
        for (index, batch) in ids.chunks(self.batch_size).enumerate() {
            if index > 0 && self.honors_cancellation() {
                if let Some(reason) = cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
            }
            match self.delete_batch(cx, batch).await {
                Outcome::Ok(n) => total += n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(total)
    }

    /// Delete every row matching `filter`, streaming ids in batches.
    pub async fn delete_where(&self, cx: &Cx, filter: Filter) -> Outcome<u64, Error> {
        let filter = self.scoped(filter);
        let mut cursor = match self
            .session
            .find_ids(cx, &self.info.collection, &filter, self.batch_size)
            .await
        {
            Outcome::Ok(cursor) => cursor,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut total = 0;
        let mut batches = 0usize;
        loop {
            if batches > 0 && self.honors_cancellation() {
                if let Some(reason) = cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
            }
            let ids = match cursor.next_batch(cx).await {
                Outcome::Ok(Some(ids)) => ids,
                Outcome::Ok(None) => break,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            batches += 1;
            match self.delete_batch(cx, &ids).await {
                Outcome::Ok(n) => total += n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::debug!(
            target: "docmodel::delete",
            collection = %self.info.collection,
            batches,
            deleted = total,
            "predicate delete complete"
        );
        Outcome::Ok(total)
    }
}
