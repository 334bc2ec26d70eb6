//! Live query registry for the in-process store.

use super::{DropReason, Query, QueryEvent, QueryHandle, Snapshot, SubscriptionId};
use crate::error::Result;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Internal live query state.
struct LiveQuery {
    query: Query,
    sender: Sender<QueryEvent>,
    /// Store-side end of the same channel, used to discard superseded
    /// snapshots when the consumer falls behind.
    backlog: Receiver<QueryEvent>,
    /// Dead once the consumer's handle is dropped.
    consumer: Weak<()>,
}

impl LiveQuery {
    /// Try to send an event. Returns false if the consumer is gone or the
    /// buffer stayed full (the query will be removed).
    fn try_send(&self, event: QueryEvent) -> bool {
        if self.consumer.strong_count() == 0 {
            return false;
        }
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                // Snapshots carry the full result set, only the newest matters
                let stale = self.backlog.try_iter().count();
                tracing::debug!(stale, collection = %self.query.collection, "discarded superseded snapshots");
                self.sender.try_send(event).is_ok()
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn watches(&self, collection: &str) -> bool {
        self.query.collection == collection
    }
}

/// Registry of live queries.
pub(crate) struct LiveQueryRegistry {
    queries: RwLock<HashMap<SubscriptionId, LiveQuery>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl LiveQueryRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            queries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Register a live query. Nothing is delivered until the caller sends
    /// the initial snapshot with [`send_to`](Self::send_to).
    pub fn register(&self, query: Query) -> QueryHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);
        let handle = QueryHandle::new(id, receiver);
        let live = LiveQuery {
            query,
            sender,
            backlog: handle.receiver.clone(),
            consumer: Arc::downgrade(&handle._consumer),
        };
        self.queries.write().insert(id, live);
        handle
    }

    /// Remove a live query and tell its receiver (best effort).
    pub fn unregister(&self, id: SubscriptionId) {
        if let Some(live) = self.queries.write().remove(&id) {
            let _ = live.sender.try_send(QueryEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Remove a live query without notifying (after a terminal error).
    pub fn remove(&self, id: SubscriptionId) {
        self.queries.write().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.queries.read().len()
    }

    /// Send an event to one live query. Returns false if it was dropped.
    pub fn send_to(&self, id: SubscriptionId, event: QueryEvent) -> bool {
        let delivered = match self.queries.read().get(&id) {
            Some(live) => live.try_send(event),
            None => return false,
        };
        if !delivered {
            self.drop_overflowed(vec![id]);
        }
        delivered
    }

    /// Re-evaluate every live query watching one of `collections` and send
    /// the fresh snapshot. Queries whose evaluation fails get the error and
    /// are removed.
    pub fn broadcast<F>(&self, collections: &[String], version: u64, evaluate: F)
    where
        F: Fn(&Query) -> Result<Vec<super::Document>>,
    {
        let mut overflowed = Vec::new();
        let mut failed = Vec::new();

        {
            let queries = self.queries.read();
            for (id, live) in queries.iter() {
                if !collections.iter().any(|c| live.watches(c)) {
                    continue;
                }
                let event = match evaluate(&live.query) {
                    Ok(documents) => QueryEvent::Snapshot(Snapshot { documents, version }),
                    Err(err) => {
                        failed.push(*id);
                        QueryEvent::Error(err)
                    }
                };
                if !live.try_send(event) {
                    overflowed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            let mut queries = self.queries.write();
            for id in failed {
                queries.remove(&id);
            }
        }
        self.drop_overflowed(overflowed);
    }

    fn drop_overflowed(&self, ids: Vec<SubscriptionId>) {
        if ids.is_empty() {
            return;
        }
        let mut queries = self.queries.write();
        for id in ids {
            if let Some(live) = queries.remove(&id) {
                tracing::warn!(subscription = id.0, collection = %live.query.collection, "dropping undeliverable live query");
                // Might fail when the buffer is still full, that's ok
                let _ = live.sender.try_send(QueryEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreErrorKind, SyncError};
    use crate::remote::Document;
    use std::time::Duration;

    #[test]
    fn test_register_unregister() {
        let registry = LiveQueryRegistry::new(4);
        let handle = registry.register(Query::collection("jobs"));
        assert_eq!(registry.count(), 1);

        registry.unregister(handle.id);
        assert_eq!(registry.count(), 0);
        let event = handle.recv_timeout(Duration::from_millis(50)).unwrap();
        assert!(matches!(
            event,
            QueryEvent::Dropped {
                reason: DropReason::Unsubscribed
            }
        ));
    }

    #[test]
    fn test_broadcast_only_to_watched_collection() {
        let registry = LiveQueryRegistry::new(4);
        let jobs = registry.register(Query::collection("jobs"));
        let users = registry.register(Query::collection("users"));

        registry.broadcast(&["jobs".to_string()], 1, |_| {
            Ok(vec![Document::new("j1", Default::default())])
        });

        assert!(matches!(jobs.try_recv(), Ok(QueryEvent::Snapshot(s)) if s.version == 1));
        assert!(users.try_recv().is_err());
    }

    #[test]
    fn test_failed_evaluation_removes_query() {
        let registry = LiveQueryRegistry::new(4);
        let handle = registry.register(Query::collection("jobs"));

        registry.broadcast(&["jobs".to_string()], 1, |_| {
            Err(SyncError::store(StoreErrorKind::PermissionDenied, "denied"))
        });

        assert!(matches!(handle.try_recv(), Ok(QueryEvent::Error(_))));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_slow_subscriber_keeps_latest_snapshot() {
        let registry = LiveQueryRegistry::new(2);
        let handle = registry.register(Query::collection("jobs"));

        for version in 0..10 {
            registry.broadcast(&["jobs".to_string()], version, |_| Ok(vec![]));
        }

        assert_eq!(registry.count(), 1);
        let versions: Vec<u64> = handle
            .receiver
            .try_iter()
            .map(|event| match event {
                QueryEvent::Snapshot(s) => s.version,
                other => panic!("Expected a snapshot, got {:?}", other),
            })
            .collect();
        assert!(versions.len() <= 2);
        assert_eq!(versions.last(), Some(&9));
    }

    #[test]
    fn test_dropped_handle_is_forgotten() {
        let registry = LiveQueryRegistry::new(2);
        drop(registry.register(Query::collection("jobs")));

        registry.broadcast(&["jobs".to_string()], 1, |_| Ok(vec![]));
        assert_eq!(registry.count(), 0);
    }
}
