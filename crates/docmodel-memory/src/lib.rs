//! In-memory document store for DocModel Rust.
//!
//! `docmodel-memory` implements [`DocumentStore`] over process-local maps. It is
//! meant for tests and local development:
//!
//! - **Topology switch**: [`MemoryStore::without_transactions`] behaves like a
//!   standalone server, so every write commits independently.
//! - **Transactions**: a session transaction stages a private copy of the data;
//!   commit publishes it, abort (or dropping the session) discards it. There is
//!   no isolation between concurrent transactions; the last commit wins.
//! - **Fault injection**: transient write conflicts and arbitrary store errors
//!   can be queued for upcoming bulk writes.
//! - **Call statistics**: bulk writes, finds, counts and deletes are recorded so
//!   tests can assert on batching.

use asupersync::{Cx, Outcome};
use docmodel_core::{
    BulkWriteResult, Document, DocumentStore, Error, Filter, ID_FIELD, IdCursor, SessionOptions,
    StoreError, StoreErrorKind, StoreSession, TransactionErrorKind, TransactionOptions, WriteModel,
    document_id,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Collection name -> (id -> document). Ids iterate in sorted order.
type Collections = HashMap<String, BTreeMap<String, Document>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One recorded `delete_many` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCall {
    pub collection: String,
    /// Number of ids in the filter, when the filter is an id set.
    pub id_count: Option<usize>,
    pub deleted: u64,
}

/// Counters for store calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sessions_started: usize,
    pub bulk_write_calls: usize,
    pub find_calls: usize,
    pub count_calls: usize,
    pub find_ids_calls: usize,
    pub transactions_started: usize,
    pub commits: usize,
    pub aborts: usize,
    pub delete_calls: Vec<DeleteCall>,
}

impl StoreStats {
    /// `delete_many` calls issued against `collection`.
    pub fn deletes_on(&self, collection: &str) -> Vec<&DeleteCall> {
        self.delete_calls
            .iter()
            .filter(|c| c.collection == collection)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Faults {
    transient_conflicts: usize,
    errors: VecDeque<StoreErrorKind>,
}

#[derive(Debug)]
struct Shared {
    data: Mutex<Collections>,
    faults: Mutex<Faults>,
    stats: Mutex<StoreStats>,
    supports_transactions: bool,
}

/// An in-memory document store.
///
/// Cloning is cheap; clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store whose topology supports multi-document transactions.
    pub fn new() -> Self {
        Self::with_transactions(true)
    }

    /// A store whose topology does not support transactions.
    pub fn without_transactions() -> Self {
        Self::with_transactions(false)
    }

    fn with_transactions(supports_transactions: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                stats: Mutex::new(StoreStats::default()),
                supports_transactions,
            }),
        }
    }

    /// Make the next `count` bulk writes fail with a transient write conflict.
    pub fn inject_transient_conflicts(&self, count: usize) {
        lock(&self.shared.faults).transient_conflicts = count;
    }

    /// Make the next bulk write fail with an error of `kind`.
    pub fn inject_error(&self, kind: StoreErrorKind) {
        lock(&self.shared.faults).errors.push_back(kind);
    }

    /// Insert or overwrite a document directly, bypassing sessions.
    pub fn insert_raw(&self, collection: &str, doc: Document) {
        let Some(id) = document_id(&doc).map(str::to_string) else {
            tracing::warn!(collection = collection, "insert_raw ignored a document without _id");
            return;
        };
        lock(&self.shared.data)
            .entry(collection.to_string())
            .or_default()
            .insert(id, doc);
    }

    /// Committed documents of `collection`, in id order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        lock(&self.shared.data)
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed document by id.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        lock(&self.shared.data)
            .get(collection)
            .and_then(|c| c.get(id).cloned())
    }

    /// Number of committed documents in `collection`.
    pub fn count_raw(&self, collection: &str) -> usize {
        lock(&self.shared.data).get(collection).map_or(0, BTreeMap::len)
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> StoreStats {
        lock(&self.shared.stats).clone()
    }

    pub fn reset_stats(&self) {
        *lock(&self.shared.stats) = StoreStats::default();
    }

    /// Open a session without going through the async contract.
    pub fn session(&self) -> MemorySession {
        lock(&self.shared.stats).sessions_started += 1;
        MemorySession {
            shared: Arc::clone(&self.shared),
            staged: Mutex::new(None),
        }
    }
}

impl DocumentStore for MemoryStore {
    type Session = MemorySession;

    fn supports_transactions(&self) -> bool {
        self.shared.supports_transactions
    }

    fn start_session(
        &self,
        cx: &Cx,
        options: &SessionOptions,
    ) -> impl Future<Output = Outcome<Self::Session, Error>> + Send {
        let cancelled = cx.cancel_reason();
        tracing::debug!(
            causal_consistency = options.causal_consistency,
            "memory store session started"
        );
        let session = self.session();
        async move {
            if let Some(reason) = cancelled {
                return Outcome::Cancelled(reason);
            }
            Outcome::Ok(session)
        }
    }
}

/// A session against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    /// Private copy of the data while a transaction is open.
    staged: Mutex<Option<Collections>>,
}

impl MemorySession {
    /// Run `f` against the transaction's staged data, or the committed data outside one.
    fn with_data<R>(&self, f: impl FnOnce(&mut Collections) -> R) -> R {
        let mut staged = lock(&self.staged);
        if let Some(data) = staged.as_mut() {
            return f(data);
        }
        drop(staged);
        f(&mut lock(&self.shared.data))
    }

    fn take_fault(&self) -> Option<Error> {
        let mut faults = lock(&self.shared.faults);
        if faults.transient_conflicts > 0 {
            faults.transient_conflicts -= 1;
            return Some(Error::store(
                StoreErrorKind::TransientWriteConflict,
                "WriteConflict: please retry your operation",
            ));
        }
        faults
            .errors
            .pop_front()
            .map(|kind| Error::store(kind, "injected failure"))
    }

    fn apply_bulk(&self, collection: &str, operations: Vec<WriteModel>, ordered: bool) -> Result<BulkWriteResult, Error> {
        self.with_data(|data| {
            let docs = data.entry(collection.to_string()).or_default();
            let mut result = BulkWriteResult::default();
            let mut first_error = None;

            for op in operations {
                let applied = apply_one(docs, op, &mut result);
                if let Err(e) = applied {
                    if ordered {
                        return Err(e);
                    }
                    first_error.get_or_insert(e);
                }
            }

            match first_error {
                Some(e) => Err(e),
                None => Ok(result),
            }
        })
    }
}

fn apply_one(
    docs: &mut BTreeMap<String, Document>,
    op: WriteModel,
    result: &mut BulkWriteResult,
) -> Result<(), Error> {
    match op {
        WriteModel::ReplaceOne {
            filter,
            replacement,
            upsert,
        } => {
            let target = docs
                .iter()
                .find(|(_, doc)| filter.matches(doc))
                .map(|(id, _)| id.clone());
            if let Some(id) = target {
                result.matched += 1;
                let mut replacement = replacement;
                replacement.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                if docs.get(&id) != Some(&replacement) {
                    result.modified += 1;
                    docs.insert(id, replacement);
                }
                return Ok(());
            }
            if !upsert {
                return Ok(());
            }
            let id = document_id(&replacement)
                .map(str::to_string)
                .ok_or_else(|| Error::store(StoreErrorKind::Other, "upsert without _id"))?;
            if docs.contains_key(&id) {
                return Err(duplicate_key(&id));
            }
            docs.insert(id, replacement);
            result.upserted += 1;
            Ok(())
        }
    }
}

fn duplicate_key(id: &str) -> Error {
    Error::Store(StoreError {
        kind: StoreErrorKind::DuplicateKey,
        message: format!("E11000 duplicate key error: {{ _id: \"{}\" }}", id),
        id: Some(id.to_string()),
        source: None,
    })
}

/// Ids named by an `_id IN [...]` filter, if that is the filter's shape.
fn id_set(filter: &Filter) -> Option<Vec<&str>> {
    match filter {
        Filter::In(field, values) if field == ID_FIELD => {
            Some(values.iter().filter_map(Value::as_str).collect())
        }
        _ => None,
    }
}

fn ready<T: Send>(cx: &Cx, value: impl FnOnce() -> Outcome<T, Error>) -> impl Future<Output = Outcome<T, Error>> + Send {
    let outcome = match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => value(),
    };
    async move { outcome }
}

impl StoreSession for MemorySession {
    type Cursor = MemoryCursor;

    fn in_transaction(&self) -> bool {
        lock(&self.staged).is_some()
    }

    fn start_transaction(&self, options: &TransactionOptions) -> docmodel_core::Result<()> {
        if !self.shared.supports_transactions {
            return Err(Error::transaction(
                TransactionErrorKind::NotSupported,
                "transactions require a replica set",
            ));
        }
        let mut staged = lock(&self.staged);
        if staged.is_some() {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "transaction already in progress",
            ));
        }
        tracing::trace!(
            read_concern = ?options.read_concern,
            write_concern = ?options.write_concern,
            "memory transaction started"
        );
        *staged = Some(lock(&self.shared.data).clone());
        lock(&self.shared.stats).transactions_started += 1;
        Ok(())
    }

    fn commit_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready(cx, || {
            let Some(data) = lock(&self.staged).take() else {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::NotActive,
                    "no transaction started",
                ));
            };
            *lock(&self.shared.data) = data;
            lock(&self.shared.stats).commits += 1;
            Outcome::Ok(())
        })
    }

    // Aborts run even under cancellation: they are the cleanup path.
    fn abort_transaction(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = if lock(&self.staged).take().is_none() {
            Outcome::Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "no transaction started",
            ))
        } else {
            lock(&self.shared.stats).aborts += 1;
            Outcome::Ok(())
        };
        async move { outcome }
    }

    fn find(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<Vec<Document>, Error>> + Send {
        ready(cx, || {
            lock(&self.shared.stats).find_calls += 1;
            if let Err(e) = filter.validate() {
                return Outcome::Err(e);
            }
            Outcome::Ok(self.with_data(|data| {
                data.get(collection)
                    .map(|docs| {
                        docs.values()
                            .filter(|doc| filter.matches(doc))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            }))
        })
    }

    fn count(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(cx, || {
            lock(&self.shared.stats).count_calls += 1;
            if let Err(e) = filter.validate() {
                return Outcome::Err(e);
            }
            Outcome::Ok(self.with_data(|data| {
                data.get(collection).map_or(0, |docs| {
                    docs.values().filter(|doc| filter.matches(doc)).count() as u64
                })
            }))
        })
    }

    fn find_ids(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
        batch_size: usize,
    ) -> impl Future<Output = Outcome<Self::Cursor, Error>> + Send {
        ready(cx, move || {
            lock(&self.shared.stats).find_ids_calls += 1;
            if let Err(e) = filter.validate() {
                return Outcome::Err(e);
            }
            let ids: Vec<String> = self.with_data(|data| {
                data.get(collection)
                    .map(|docs| {
                        docs.iter()
                            .filter(|(_, doc)| filter.matches(doc))
                            .map(|(id, _)| id.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            });
            let batch_size = batch_size.max(1);
            let batches = ids.chunks(batch_size).map(<[String]>::to_vec).collect();
            Outcome::Ok(MemoryCursor { batches })
        })
    }

    fn bulk_write(
        &self,
        cx: &Cx,
        collection: &str,
        operations: Vec<WriteModel>,
        ordered: bool,
    ) -> impl Future<Output = Outcome<BulkWriteResult, Error>> + Send {
        ready(cx, move || {
            lock(&self.shared.stats).bulk_write_calls += 1;
            if let Some(fault) = self.take_fault() {
                return Outcome::Err(fault);
            }
            match self.apply_bulk(collection, operations, ordered) {
                Ok(result) => Outcome::Ok(result),
                Err(e) => Outcome::Err(e),
            }
        })
    }

    fn delete_many(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(cx, || {
            if let Err(e) = filter.validate() {
                return Outcome::Err(e);
            }
            let ids = id_set(filter);
            let deleted = self.with_data(|data| {
                let Some(docs) = data.get_mut(collection) else {
                    return 0;
                };
                if let Some(ids) = &ids {
                    return ids.iter().filter(|id| docs.remove(**id).is_some()).count() as u64;
                }
                let before = docs.len();
                docs.retain(|_, doc| !filter.matches(doc));
                (before - docs.len()) as u64
            });
            lock(&self.shared.stats).delete_calls.push(DeleteCall {
                collection: collection.to_string(),
                id_count: ids.map(|ids| ids.len()),
                deleted,
            });
            Outcome::Ok(deleted)
        })
    }
}

/// Cursor over ids captured when the cursor was opened.
#[derive(Debug)]
pub struct MemoryCursor {
    batches: VecDeque<Vec<String>>,
}

impl IdCursor for MemoryCursor {
    fn next_batch(
        &mut self,
        cx: &Cx,
    ) -> impl Future<Output = Outcome<Option<Vec<String>>, Error>> + Send {
        ready(cx, || Outcome::Ok(self.batches.pop_front()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn replace(id: &str, body: Value) -> WriteModel {
        let mut replacement = doc(body);
        replacement.insert(ID_FIELD.to_string(), json!(id));
        WriteModel::ReplaceOne {
            filter: Filter::id(id),
            replacement,
            upsert: true,
        }
    }

    #[test]
    fn upsert_inserts_then_replaces() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let session = store.session();

        rt.block_on(async {
            let first = unwrap_outcome(
                session
                    .bulk_write(&cx, "items", vec![replace("a", json!({"n": 1}))], false)
                    .await,
            );
            assert_eq!(first.upserted, 1);
            assert_eq!(first.matched, 0);

            let second = unwrap_outcome(
                session
                    .bulk_write(&cx, "items", vec![replace("a", json!({"n": 2}))], false)
                    .await,
            );
            assert_eq!(second.upserted, 0);
            assert_eq!(second.matched, 1);
            assert_eq!(second.modified, 1);

            let same = unwrap_outcome(
                session
                    .bulk_write(&cx, "items", vec![replace("a", json!({"n": 2}))], false)
                    .await,
            );
            assert_eq!(same.matched, 1);
            assert_eq!(same.modified, 0);
        });

        assert_eq!(store.count_raw("items"), 1);
        assert_eq!(store.document("items", "a").unwrap()["n"], json!(2));
    }

    #[test]
    fn upsert_with_stale_filter_is_duplicate_key() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.insert_raw("items", doc(json!({"_id": "a", "v": 2})));
        let session = store.session();

        let outcome = rt.block_on(async {
            let mut replacement = doc(json!({"_id": "a", "v": 3}));
            replacement.insert("x".to_string(), json!(true));
            session
                .bulk_write(
                    &cx,
                    "items",
                    vec![WriteModel::ReplaceOne {
                        filter: Filter::id("a").and(Filter::eq("v", 1)),
                        replacement,
                        upsert: true,
                    }],
                    false,
                )
                .await
        });

        match outcome {
            Outcome::Err(e) => assert!(e.is_duplicate_key()),
            other => panic!("expected duplicate key, got {other:?}"),
        }
    }

    #[test]
    fn transaction_commit_and_abort() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let session = store.session();

        rt.block_on(async {
            session.start_transaction(&TransactionOptions::default()).unwrap();
            assert!(session.in_transaction());
            unwrap_outcome(
                session
                    .bulk_write(&cx, "items", vec![replace("a", json!({}))], false)
                    .await,
            );
            assert_eq!(store.count_raw("items"), 0);
            unwrap_outcome(session.abort_transaction(&cx).await);
            assert_eq!(store.count_raw("items"), 0);

            session.start_transaction(&TransactionOptions::default()).unwrap();
            unwrap_outcome(
                session
                    .bulk_write(&cx, "items", vec![replace("b", json!({}))], false)
                    .await,
            );
            unwrap_outcome(session.commit_transaction(&cx).await);
        });

        assert_eq!(store.count_raw("items"), 1);
        let stats = store.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.aborts, 1);
    }

    #[test]
    fn standalone_topology_refuses_transactions() {
        let store = MemoryStore::without_transactions();
        assert!(!store.supports_transactions());
        let err = store
            .session()
            .start_transaction(&TransactionOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(ref t) if t.kind == TransactionErrorKind::NotSupported
        ));
    }

    #[test]
    fn injected_faults_fire_once_each() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.inject_transient_conflicts(1);
        store.inject_error(StoreErrorKind::Network);
        let session = store.session();

        rt.block_on(async {
            let first = session.bulk_write(&cx, "items", vec![replace("a", json!({}))], false).await;
            assert!(matches!(first, Outcome::Err(ref e) if e.is_transient_write_conflict()));
            let second = session.bulk_write(&cx, "items", vec![replace("a", json!({}))], false).await;
            assert!(matches!(second, Outcome::Err(Error::Store(ref s)) if s.kind == StoreErrorKind::Network));
            unwrap_outcome(session.bulk_write(&cx, "items", vec![replace("a", json!({}))], false).await);
        });
        assert_eq!(store.stats().bulk_write_calls, 3);
    }

    #[test]
    fn id_cursor_batches_and_delete_log() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert_raw("items", doc(json!({"_id": format!("id{i}"), "k": i % 2})));
        }
        let session = store.session();

        rt.block_on(async {
            let mut cursor = unwrap_outcome(session.find_ids(&cx, "items", &Filter::All, 2).await);
            let mut sizes = Vec::new();
            while let Some(batch) = unwrap_outcome(cursor.next_batch(&cx).await) {
                sizes.push(batch.len());
            }
            assert_eq!(sizes, vec![2, 2, 1]);

            let deleted = unwrap_outcome(
                session
                    .delete_many(&cx, "items", &Filter::ids(["id0", "id1", "missing"]))
                    .await,
            );
            assert_eq!(deleted, 2);
            let deleted = unwrap_outcome(session.delete_many(&cx, "items", &Filter::eq("k", 0)).await);
            assert_eq!(deleted, 2);
        });

        let stats = store.stats();
        assert_eq!(stats.delete_calls[0].id_count, Some(3));
        assert_eq!(stats.delete_calls[1].id_count, None);
        assert_eq!(store.count_raw("items"), 1);
    }

    #[test]
    fn invalid_regex_is_rejected_before_matching() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.insert_raw("items", doc(json!({"_id": "a", "status": "open"})));
        store.insert_raw("items", doc(json!({"_id": "b", "status": "closed"})));
        let session = store.session();
        let bad = Filter::regex("status", "(open").not();

        rt.block_on(async {
            let deleted = session.delete_many(&cx, "items", &bad).await;
            assert!(matches!(deleted, Outcome::Err(Error::Argument(_))));
            let found = session.find(&cx, "items", &bad).await;
            assert!(matches!(found, Outcome::Err(Error::Argument(_))));
            let counted = session.count(&cx, "items", &bad).await;
            assert!(matches!(counted, Outcome::Err(Error::Argument(_))));
            let cursor = session.find_ids(&cx, "items", &bad, 10).await;
            assert!(matches!(cursor, Outcome::Err(Error::Argument(_))));
        });

        assert_eq!(store.count_raw("items"), 2);
        assert!(store.stats().delete_calls.is_empty());
    }
}
