//! In-process implementation of the remote document store.
//!
//! Behaves like a real-time document backend as far as the core can observe:
//! server timestamps are resolved at commit and strictly increase, increments
//! are applied at commit against the committed value, transactions apply all
//! or nothing, and live queries receive a fresh full snapshot after every
//! commit that touches their collection.
//!
//! It also models the backend's failure surface:
//! - composite-index requirements (`failed-precondition`)
//! - collections that reject ordering (`invalid-argument`)
//! - per-collection read/write denial (`permission-denied`)
//! - injected commit aborts after a chosen number of staged writes

use super::subscriptions::LiveQueryRegistry;
use super::{
    Document, DocumentPath, Fields, Query, QueryEvent, QueryHandle, RemoteStore, Snapshot,
    SubscriptionId, Transaction,
};
use crate::config::SyncConfig;
use crate::error::{Result, StoreErrorKind, SyncError};
use crate::types::Timestamp;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

type Collection = BTreeMap<String, Map<String, Value>>;

/// Last path segment, which is what indexes and rules are declared against.
fn collection_id(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A write staged for commit.
#[derive(Clone, Debug)]
enum StagedWrite {
    Create(DocumentPath, Fields),
    Set(DocumentPath, Fields),
    Update(DocumentPath, Fields),
    Delete(DocumentPath),
}

impl StagedWrite {
    fn path(&self) -> &DocumentPath {
        match self {
            StagedWrite::Create(p, _)
            | StagedWrite::Set(p, _)
            | StagedWrite::Update(p, _)
            | StagedWrite::Delete(p) => p,
        }
    }
}

/// A commit failure scheduled by a test.
#[derive(Clone, Copy, Debug)]
struct CommitFault {
    kind: StoreErrorKind,
    after_writes: usize,
}

#[derive(Debug, Default)]
struct AccessPolicy {
    require_composite_indexes: bool,
    /// Keys from [`index_key`].
    indexes: HashSet<String>,
    unorderable: HashSet<String>,
    denied_reads: HashSet<String>,
    denied_writes: HashSet<String>,
}

fn index_key(collection: &str, filter_fields: &[&str], order_field: &str) -> String {
    let mut fields: Vec<&str> = filter_fields.to_vec();
    fields.sort_unstable();
    fields.dedup();
    format!("{}|{}|{}", collection, fields.join(","), order_field)
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    /// Successful commits (single writes and transactions).
    pub commits: u64,
    /// Commits that applied nothing.
    pub aborted_commits: u64,
    /// One-shot reads (`get`, `get_document`, transactional gets).
    pub reads: u64,
    /// Documents brought into existence, per collection path.
    pub created: HashMap<String, u64>,
}

impl StoreStats {
    pub fn created_in(&self, collection: &str) -> u64 {
        self.created.get(collection).copied().unwrap_or(0)
    }
}

/// The in-process document store.
pub struct MemoryStore {
    /// Documents by collection path, then id.
    data: RwLock<HashMap<String, Collection>>,

    live: LiveQueryRegistry,

    /// Serializes commits and their broadcasts.
    write_lock: Mutex<()>,

    /// Last server timestamp handed out.
    clock: Mutex<Timestamp>,

    /// Commit sequence.
    version: AtomicU64,

    policy: RwLock<AccessPolicy>,
    faults: Mutex<VecDeque<CommitFault>>,
    stats: Mutex<StoreStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_config(&SyncConfig::default())
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            live: LiveQueryRegistry::new(buffer_size),
            write_lock: Mutex::new(()),
            clock: Mutex::new(Timestamp(0)),
            version: AtomicU64::new(0),
            policy: RwLock::new(AccessPolicy::default()),
            faults: Mutex::new(VecDeque::new()),
            stats: Mutex::new(StoreStats::default()),
        }
    }

    /// Store whose live queries buffer `subscription_buffer` snapshots.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::with_buffer_size(config.subscription_buffer)
    }

    // --- Policy ---

    /// Require a declared index for filter + order-by on a different field.
    pub fn require_composite_indexes(&self, required: bool) {
        self.policy.write().require_composite_indexes = required;
    }

    /// Declare a composite index.
    pub fn add_index(&self, collection: &str, filter_fields: &[&str], order_field: &str) {
        let key = index_key(collection_id(collection), filter_fields, order_field);
        self.policy.write().indexes.insert(key);
    }

    /// Reject every ordered query on `collection` with `invalid-argument`.
    pub fn set_unorderable(&self, collection: &str, unorderable: bool) {
        let mut policy = self.policy.write();
        let id = collection_id(collection).to_string();
        if unorderable {
            policy.unorderable.insert(id);
        } else {
            policy.unorderable.remove(&id);
        }
    }

    pub fn deny_reads(&self, collection: &str) {
        let id = collection_id(collection).to_string();
        self.policy.write().denied_reads.insert(id);
    }

    pub fn deny_writes(&self, collection: &str) {
        let id = collection_id(collection).to_string();
        self.policy.write().denied_writes.insert(id);
    }

    /// Lift all read/write denials.
    pub fn allow_all(&self) {
        let mut policy = self.policy.write();
        policy.denied_reads.clear();
        policy.denied_writes.clear();
    }

    /// Make the next commit fail with `kind` after staging `after_writes`
    /// of its writes. Nothing from that commit is applied.
    pub fn inject_commit_fault(&self, kind: StoreErrorKind, after_writes: usize) {
        self.faults
            .lock()
            .push_back(CommitFault { kind, after_writes });
    }

    // --- Introspection ---

    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    pub fn live_query_count(&self) -> usize {
        self.live.count()
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.data.read().get(collection).map_or(0, |c| c.len())
    }

    /// Write a JSON object as a document, bypassing server-value resolution.
    pub fn seed(&self, collection: &str, id: &str, value: Value) -> Result<()> {
        let fields = Fields::from_serializable(&value)?;
        self.set(&DocumentPath::new(collection, id), fields)
    }

    // --- Internals ---

    fn check_read(&self, collection: &str) -> Result<()> {
        if self.policy.read().denied_reads.contains(collection_id(collection)) {
            return Err(SyncError::store(
                StoreErrorKind::PermissionDenied,
                format!("missing or insufficient permissions to read {}", collection),
            ));
        }
        Ok(())
    }

    fn check_write(&self, collection: &str) -> Result<()> {
        if self.policy.read().denied_writes.contains(collection_id(collection)) {
            return Err(SyncError::store(
                StoreErrorKind::PermissionDenied,
                format!("missing or insufficient permissions to write {}", collection),
            ));
        }
        Ok(())
    }

    fn check_query_shape(&self, query: &Query) -> Result<()> {
        let Some(order) = &query.order_by else {
            return Ok(());
        };
        let policy = self.policy.read();
        let collection = collection_id(&query.collection);
        if policy.unorderable.contains(collection) {
            return Err(SyncError::store(
                StoreErrorKind::InvalidArgument,
                format!("order by {} is not supported on {}", order.field, collection),
            ));
        }
        if policy.require_composite_indexes && query.needs_composite_index() {
            let filter_fields: Vec<&str> = query.filters.iter().map(|f| f.field()).collect();
            if !policy
                .indexes
                .contains(&index_key(collection, &filter_fields, &order.field))
            {
                return Err(SyncError::store(
                    StoreErrorKind::FailedPrecondition,
                    format!(
                        "the query requires an index on {} ({} + {})",
                        collection,
                        filter_fields.join(","),
                        order.field
                    ),
                ));
            }
        }
        Ok(())
    }

    fn evaluate(&self, query: &Query) -> Result<Vec<Document>> {
        self.check_read(&query.collection)?;
        self.check_query_shape(query)?;
        let data = self.data.read();
        let docs: Vec<Document> = data
            .get(&query.collection)
            .map(|c| {
                c.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(query.evaluate(&docs))
    }

    fn read_document(&self, path: &DocumentPath) -> Result<Option<Document>> {
        self.check_read(&path.collection)?;
        self.stats.lock().reads += 1;
        Ok(self
            .data
            .read()
            .get(&path.collection)
            .and_then(|c| c.get(&path.id))
            .map(|fields| Document::new(path.id.clone(), fields.clone())))
    }

    /// Next server timestamp; strictly greater than any handed out before.
    fn tick(&self) -> Timestamp {
        let mut clock = self.clock.lock();
        let next = Timestamp::now().max(clock.next());
        *clock = next;
        next
    }

    fn commit(&self, writes: Vec<StagedWrite>) -> Result<()> {
        let _lock = self.write_lock.lock();
        self.commit_locked(writes)
    }

    /// Apply `writes` atomically. Caller holds `write_lock`.
    fn commit_locked(&self, writes: Vec<StagedWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let result = self.stage_and_apply(&writes);
        if result.is_err() {
            self.stats.lock().aborted_commits += 1;
            return result;
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.lock().commits += 1;

        let mut touched: Vec<String> = Vec::new();
        for write in &writes {
            if !touched.contains(&write.path().collection) {
                touched.push(write.path().collection.clone());
            }
        }
        self.live.broadcast(&touched, version, |q| self.evaluate(q));
        Ok(())
    }

    fn stage_and_apply(&self, writes: &[StagedWrite]) -> Result<()> {
        for write in writes {
            self.check_write(&write.path().collection)?;
        }

        let fault = self.faults.lock().pop_front();
        let now = self.tick();
        let mut data = self.data.write();

        // Working copies; None marks a deletion.
        let mut staged: HashMap<DocumentPath, Option<Map<String, Value>>> = HashMap::new();

        for (i, write) in writes.iter().enumerate() {
            if let Some(fault) = fault {
                if fault.after_writes == i {
                    return Err(SyncError::store(
                        fault.kind,
                        format!("commit aborted after {} staged writes", i),
                    ));
                }
            }

            let path = write.path();
            let current = match staged.get(path) {
                Some(doc) => doc.clone(),
                None => data
                    .get(&path.collection)
                    .and_then(|c| c.get(&path.id))
                    .cloned(),
            };

            let next = match write {
                StagedWrite::Create(_, fields) => {
                    if current.is_some() {
                        return Err(SyncError::store(
                            StoreErrorKind::AlreadyExists,
                            format!("document already exists: {}", path),
                        ));
                    }
                    let mut doc = Map::new();
                    fields.apply_to(&mut doc, now);
                    Some(doc)
                }
                StagedWrite::Set(_, fields) => {
                    let mut doc = Map::new();
                    fields.apply_to(&mut doc, now);
                    Some(doc)
                }
                StagedWrite::Update(_, fields) => {
                    let Some(mut doc) = current else {
                        return Err(SyncError::store(
                            StoreErrorKind::NotFound,
                            format!("no document to update: {}", path),
                        ));
                    };
                    fields.apply_to(&mut doc, now);
                    Some(doc)
                }
                StagedWrite::Delete(_) => None,
            };
            staged.insert(path.clone(), next);
        }

        if let Some(fault) = fault {
            if fault.after_writes >= writes.len() {
                return Err(SyncError::store(
                    fault.kind,
                    format!("commit aborted after {} staged writes", writes.len()),
                ));
            }
        }

        let mut stats = self.stats.lock();
        for (path, doc) in staged {
            match doc {
                Some(fields) => {
                    let collection = data.entry(path.collection.clone()).or_default();
                    if collection.insert(path.id, fields).is_none() {
                        *stats.created.entry(path.collection).or_insert(0) += 1;
                    }
                }
                None => {
                    if let Some(collection) = data.get_mut(&path.collection) {
                        collection.remove(&path.id);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction over a [`MemoryStore`]; writes are staged until commit.
struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    writes: Vec<StagedWrite>,
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, path: &DocumentPath) -> Result<Option<Document>> {
        self.store.read_document(path)
    }

    fn set(&mut self, path: &DocumentPath, fields: Fields) {
        self.writes.push(StagedWrite::Set(path.clone(), fields));
    }

    fn update(&mut self, path: &DocumentPath, fields: Fields) {
        self.writes.push(StagedWrite::Update(path.clone(), fields));
    }

    fn delete(&mut self, path: &DocumentPath) {
        self.writes.push(StagedWrite::Delete(path.clone()));
    }
}

impl RemoteStore for MemoryStore {
    fn subscribe(&self, query: Query) -> QueryHandle {
        // Hold the write lock so no commit lands between registration and
        // the initial snapshot.
        let _lock = self.write_lock.lock();
        let handle = self.live.register(query.clone());
        match self.evaluate(&query) {
            Ok(documents) => {
                let version = self.version.load(Ordering::SeqCst);
                self.live
                    .send_to(handle.id, QueryEvent::Snapshot(Snapshot { documents, version }));
            }
            Err(err) => {
                tracing::debug!(collection = %query.collection, error = %err, "live query rejected");
                self.live.send_to(handle.id, QueryEvent::Error(err));
                self.live.remove(handle.id);
            }
        }
        handle
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.live.unregister(id);
    }

    fn get(&self, query: &Query) -> Result<Vec<Document>> {
        self.stats.lock().reads += 1;
        self.evaluate(query)
    }

    fn get_document(&self, path: &DocumentPath) -> Result<Option<Document>> {
        self.read_document(path)
    }

    fn new_document_id(&self, _collection: &str) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn create(&self, path: &DocumentPath, fields: Fields) -> Result<()> {
        self.commit(vec![StagedWrite::Create(path.clone(), fields)])
    }

    fn set(&self, path: &DocumentPath, fields: Fields) -> Result<()> {
        self.commit(vec![StagedWrite::Set(path.clone(), fields)])
    }

    fn update(&self, path: &DocumentPath, fields: Fields) -> Result<()> {
        self.commit(vec![StagedWrite::Update(path.clone(), fields)])
    }

    fn delete(&self, path: &DocumentPath) -> Result<()> {
        self.commit(vec![StagedWrite::Delete(path.clone())])
    }

    fn run_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
    ) -> Result<()> {
        let _lock = self.write_lock.lock();
        let mut tx = MemoryTransaction {
            store: self,
            writes: Vec::new(),
        };
        if let Err(err) = body(&mut tx) {
            self.stats.lock().aborted_commits += 1;
            return Err(err);
        }
        let writes = tx.writes;
        self.commit_locked(writes)
    }
}
