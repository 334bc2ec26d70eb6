//! Boundary to the remote real-time document store.
//!
//! The core never talks to a backend directly; it consumes the narrow
//! [`RemoteStore`] interface:
//! - one-shot document and query reads
//! - single-document writes (`create`, `set`, `update`, `delete`)
//! - atomic multi-document transactions
//! - live queries delivering full ordered snapshots over a channel
//!
//! [`MemoryStore`] is a complete in-process implementation.
//!
//! # Example
//!
//! ```ignore
//! let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
//!
//! let handle = store.subscribe(
//!     Query::collection("jobs").order_by("createdAt", Direction::Descending),
//! );
//! loop {
//!     match handle.recv() {
//!         Ok(QueryEvent::Snapshot(snapshot)) => println!("{} jobs", snapshot.documents.len()),
//!         Ok(QueryEvent::Error(err)) => break,
//!         Ok(QueryEvent::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod document;
pub mod memory;
mod query;
mod subscriptions;

pub use document::{Document, DocumentPath, FieldValue, Fields};
pub use memory::{MemoryStore, StoreStats};
pub use query::{compare_values, sort_documents, Direction, Filter, OrderBy, Query};

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// Unique identifier for a live query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One result set of a live query.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Matching documents, ordered as the query asked.
    pub documents: Vec<Document>,
    /// Commit sequence this snapshot reflects.
    pub version: u64,
}

/// Events delivered to a live query.
#[derive(Clone, Debug)]
pub enum QueryEvent {
    /// Full result set after a change.
    Snapshot(Snapshot),
    /// The listener failed and was removed by the store.
    Error(SyncError),
    /// The listener was removed for a non-error reason.
    Dropped { reason: DropReason },
}

/// Why a live query was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Events could not be delivered, even after discarding superseded
    /// snapshots.
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Handle to a live query.
pub struct QueryHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<QueryEvent>,
    /// Keeps the live query registered while the handle exists.
    pub(crate) _consumer: std::sync::Arc<()>,
}

impl QueryHandle {
    pub fn new(id: SubscriptionId, receiver: crossbeam_channel::Receiver<QueryEvent>) -> Self {
        Self {
            id,
            receiver,
            _consumer: std::sync::Arc::new(()),
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<QueryEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<QueryEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<QueryEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Writes staged inside a transaction; applied atomically on commit.
pub trait Transaction {
    /// Read a document as of the transaction.
    fn get(&mut self, path: &DocumentPath) -> Result<Option<Document>>;

    /// Replace (or create) a document.
    fn set(&mut self, path: &DocumentPath, fields: Fields);

    /// Merge into an existing document; the commit fails if it is missing.
    fn update(&mut self, path: &DocumentPath, fields: Fields);

    fn delete(&mut self, path: &DocumentPath);
}

/// A real-time document store.
///
/// Implementations are shared process-wide (`Arc<dyn RemoteStore>`).
pub trait RemoteStore: Send + Sync {
    /// Start a live query. The first event is the initial snapshot or an error.
    fn subscribe(&self, query: Query) -> QueryHandle;

    /// Stop a live query. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// One-shot query.
    fn get(&self, query: &Query) -> Result<Vec<Document>>;

    /// One-shot document read.
    fn get_document(&self, path: &DocumentPath) -> Result<Option<Document>>;

    /// Allocate a fresh document id.
    fn new_document_id(&self, collection: &str) -> String;

    /// Create a document; fails with `AlreadyExists` if it is present.
    fn create(&self, path: &DocumentPath, fields: Fields) -> Result<()>;

    /// Replace (or create) a document.
    fn set(&self, path: &DocumentPath, fields: Fields) -> Result<()>;

    /// Merge into an existing document; fails with `NotFound` if missing.
    fn update(&self, path: &DocumentPath, fields: Fields) -> Result<()>;

    /// Delete a document. Deleting a missing document succeeds.
    fn delete(&self, path: &DocumentPath) -> Result<()>;

    /// Run `body` and commit its staged writes atomically.
    ///
    /// If `body` returns an error, or the commit fails, nothing is applied.
    fn run_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
    ) -> Result<()>;
}
