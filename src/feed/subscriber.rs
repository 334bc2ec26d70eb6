//! Self-healing live subscription for one logical feed.

use crate::error::{ErrorClass, SyncError};
use crate::remote::{
    sort_documents, Direction, Document, DropReason, Filter, Query, QueryEvent, QueryHandle,
    RemoteStore,
};
use crossbeam_channel::TryRecvError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a feed shows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedSpec {
    pub collection: String,

    /// Optional single-field predicate.
    pub filter: Option<Filter>,

    /// Field the feed is ordered by.
    pub order_field: String,

    pub direction: Direction,

    /// Max items shown (None = all).
    pub limit: Option<usize>,
}

impl FeedSpec {
    /// Ascending feed over `collection` ordered by `order_field`.
    pub fn new(collection: impl Into<String>, order_field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
            order_field: order_field.into(),
            direction: Direction::Ascending,
            limit: None,
        }
    }

    pub fn ascending(mut self) -> Self {
        self.direction = Direction::Ascending;
        self
    }

    pub fn descending(mut self) -> Self {
        self.direction = Direction::Descending;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter + order-by + limit, answered in order by the store.
    pub fn preferred_query(&self) -> Query {
        let mut query = Query::collection(self.collection.clone())
            .order_by(self.order_field.clone(), self.direction);
        if let Some(filter) = &self.filter {
            query = query.filter(filter.clone());
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }

    /// Filter only; ordering and limit are applied client-side.
    pub fn fallback_query(&self) -> Query {
        let mut query = Query::collection(self.collection.clone());
        if let Some(filter) = &self.filter {
            query = query.filter(filter.clone());
        }
        query
    }
}

/// What the consumer currently sees.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedState {
    /// No result set delivered yet.
    Loading,
    /// Latest ordered result set (possibly empty).
    Ready(Vec<Document>),
    /// Reading the feed is not allowed. Terminal.
    AccessDenied(SyncError),
    /// The feed failed for another reason. Terminal.
    Failed(SyncError),
}

impl FeedState {
    pub fn is_loading(&self) -> bool {
        matches!(self, FeedState::Loading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedState::AccessDenied(_) | FeedState::Failed(_))
    }

    /// Items of a ready feed; empty otherwise.
    pub fn items(&self) -> &[Document] {
        match self {
            FeedState::Ready(items) => items,
            _ => &[],
        }
    }
}

/// Emitted by [`ResilientQuerySubscriber::poll`].
#[derive(Clone, Debug, PartialEq)]
pub enum FeedUpdate {
    /// A new ordered result set.
    Items(Vec<Document>),
    AccessDenied(SyncError),
    Failed(SyncError),
}

/// Which branch is serving the feed. Not visible to consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FeedMode {
    /// Store answers filter + order + limit.
    ServerOrdered,
    /// Store answers the filter; ordering and limit happen here.
    ClientSorted,
}

struct ActiveQuery {
    handle: QueryHandle,
    mode: FeedMode,
}

/// One live subscription per logical feed that falls back to client-side
/// ordering when the store cannot serve the ordered query.
pub struct ResilientQuerySubscriber {
    store: Arc<dyn RemoteStore>,
    spec: FeedSpec,
    active: Option<ActiveQuery>,
    state: FeedState,
}

impl ResilientQuerySubscriber {
    /// Start watching a feed with the preferred (server-ordered) query.
    pub fn watch(store: Arc<dyn RemoteStore>, spec: FeedSpec) -> Self {
        let handle = store.subscribe(spec.preferred_query());
        tracing::debug!(
            collection = %spec.collection,
            subscription = handle.id.0,
            "watching feed"
        );
        Self {
            store,
            spec,
            active: Some(ActiveQuery {
                handle,
                mode: FeedMode::ServerOrdered,
            }),
            state: FeedState::Loading,
        }
    }

    pub fn spec(&self) -> &FeedSpec {
        &self.spec
    }

    pub fn state(&self) -> &FeedState {
        &self.state
    }

    /// Whether a live subscription is currently held.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn mode(&self) -> Option<FeedMode> {
        self.active.as_ref().map(|a| a.mode)
    }

    /// Drain pending store events and return what the consumer should see.
    pub fn poll(&mut self) -> Vec<FeedUpdate> {
        let mut updates = Vec::new();

        loop {
            let next = match &self.active {
                Some(active) => active.handle.try_recv(),
                None => break,
            };

            let event = match next {
                Ok(event) => event,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.fail(
                        SyncError::SubscriptionDropped("store closed the live query".into()),
                        &mut updates,
                    );
                    break;
                }
            };

            match event {
                QueryEvent::Snapshot(snapshot) => {
                    let items = self.present(snapshot.documents);
                    self.state = FeedState::Ready(items.clone());
                    updates.push(FeedUpdate::Items(items));
                }
                QueryEvent::Error(err) => self.handle_error(err, &mut updates),
                QueryEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                } => {
                    self.fail(
                        SyncError::SubscriptionDropped("live query could not be delivered".into()),
                        &mut updates,
                    );
                }
                QueryEvent::Dropped {
                    reason: DropReason::Unsubscribed,
                } => {}
            }
        }

        updates
    }

    /// Stop the active subscription. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(active) = self.active.take() {
            self.store.unsubscribe(active.handle.id);
            tracing::debug!(
                collection = %self.spec.collection,
                subscription = active.handle.id.0,
                "feed terminated"
            );
        }
    }

    fn present(&self, mut documents: Vec<Document>) -> Vec<Document> {
        if self.mode() == Some(FeedMode::ClientSorted) {
            sort_documents(&mut documents, &self.spec.order_field, self.spec.direction);
            if let Some(limit) = self.spec.limit {
                documents.truncate(limit);
            }
        }
        documents
    }

    fn handle_error(&mut self, err: SyncError, updates: &mut Vec<FeedUpdate>) {
        match (err.class(), self.mode()) {
            (ErrorClass::Capability, Some(FeedMode::ServerOrdered)) => self.fall_back(&err),
            (ErrorClass::Permission, _) => {
                tracing::warn!(collection = %self.spec.collection, error = %err, "feed access denied");
                self.terminate();
                self.state = FeedState::AccessDenied(err.clone());
                updates.push(FeedUpdate::AccessDenied(err));
            }
            _ => self.fail(err, updates),
        }
    }

    /// Swap to the unordered query. The new listener is registered before
    /// the old one is released.
    fn fall_back(&mut self, cause: &SyncError) {
        let handle = self.store.subscribe(self.spec.fallback_query());
        tracing::info!(
            collection = %self.spec.collection,
            order_field = %self.spec.order_field,
            cause = %cause,
            "ordered query rejected, sorting client-side"
        );
        let previous = self.active.replace(ActiveQuery {
            handle,
            mode: FeedMode::ClientSorted,
        });
        if let Some(previous) = previous {
            self.store.unsubscribe(previous.handle.id);
        }
    }

    fn fail(&mut self, err: SyncError, updates: &mut Vec<FeedUpdate>) {
        tracing::warn!(collection = %self.spec.collection, error = %err, "feed failed");
        self.terminate();
        self.state = FeedState::Failed(err.clone());
        updates.push(FeedUpdate::Failed(err));
    }
}

impl Drop for ResilientQuerySubscriber {
    fn drop(&mut self) {
        self.terminate();
    }
}
