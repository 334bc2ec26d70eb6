//! Live list of the conversations a user participates in.

use super::documents::{decode_conversation, mark_read, MEMBER_IDS, UPDATED_AT};
use crate::auth::{AuthEvent, AuthState};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::feed::{FeedSpec, FeedUpdate, ResilientQuerySubscriber};
use crate::remote::{Filter, RemoteStore};
use crate::types::{Conversation, ConversationId, UserId};
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// Emitted by [`ConversationDirectory::poll`].
#[derive(Clone, Debug, PartialEq)]
pub enum DirectoryUpdate {
    /// The full list, most recently updated first.
    Conversations(Vec<Conversation>),
    /// Listing is not allowed for this user. Not retried.
    AccessDenied(SyncError),
    /// The listing failed; the last known list is kept.
    Failed(SyncError),
}

/// Conversations of the current user, ordered by last update (newest first),
/// each carrying that user's own unread count.
pub struct ConversationDirectory {
    store: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
    user: Option<UserId>,
    feed: Option<ResilientQuerySubscriber>,
    auth_events: Option<Receiver<AuthEvent>>,
    conversations: Vec<Conversation>,
    loaded: bool,
    /// Updates produced outside `poll` (e.g. by `set_user`).
    pending: Vec<DirectoryUpdate>,
}

impl ConversationDirectory {
    pub fn new(store: Arc<dyn RemoteStore>, config: Arc<SyncConfig>) -> Self {
        Self {
            store,
            config,
            user: None,
            feed: None,
            auth_events: None,
            conversations: Vec::new(),
            loaded: true,
            pending: Vec::new(),
        }
    }

    /// Track the signed-in user of `auth` from now on.
    pub fn follow(&mut self, auth: &AuthState) {
        self.auth_events = Some(auth.watch());
    }

    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Switch to another user (or none). Re-subscribes only on change.
    pub fn set_user(&mut self, user: Option<UserId>) {
        if self.user == user {
            return;
        }
        if let Some(mut feed) = self.feed.take() {
            feed.terminate();
        }
        self.conversations.clear();
        self.user = user;

        match &self.user {
            Some(user) => {
                let spec = FeedSpec::new(self.config.conversations_collection.clone(), UPDATED_AT)
                    .descending()
                    .filter(Filter::array_contains(MEMBER_IDS, user.as_str()));
                self.feed = Some(ResilientQuerySubscriber::watch(self.store.clone(), spec));
                self.loaded = false;
                tracing::debug!(user = %user, "directory subscribed");
            }
            None => {
                self.loaded = true;
                self.pending.push(DirectoryUpdate::Conversations(Vec::new()));
            }
        }
    }

    /// Apply pending auth changes and snapshots.
    pub fn poll(&mut self) -> Vec<DirectoryUpdate> {
        if let Some(events) = &self.auth_events {
            let latest = events.try_iter().last();
            if let Some(event) = latest {
                let user = match event {
                    AuthEvent::SignedIn(identity) => Some(identity.user_id),
                    AuthEvent::SignedOut => None,
                };
                self.set_user(user);
            }
        }

        let mut updates = std::mem::take(&mut self.pending);

        let (Some(feed), Some(user)) = (self.feed.as_mut(), self.user.as_ref()) else {
            return updates;
        };

        for update in feed.poll() {
            match update {
                FeedUpdate::Items(docs) => {
                    self.conversations = docs
                        .iter()
                        .map(|doc| decode_conversation(doc, user, &self.config))
                        .collect();
                    self.loaded = true;
                    updates.push(DirectoryUpdate::Conversations(self.conversations.clone()));
                }
                FeedUpdate::AccessDenied(err) => {
                    self.loaded = true;
                    updates.push(DirectoryUpdate::AccessDenied(err));
                }
                FeedUpdate::Failed(err) => {
                    tracing::warn!(user = %user, error = %err, "conversation listing failed");
                    self.loaded = true;
                    updates.push(DirectoryUpdate::Failed(err));
                }
            }
        }

        updates
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// False while the first snapshot for the current user is outstanding.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// An existing conversation containing both `me` and `peer`.
    pub fn find_with_peer(&self, me: &UserId, peer: &UserId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.has_members(me, peer))
    }

    /// Conversations whose title or last message contains `query`
    /// (case-insensitive). An empty query matches everything.
    pub fn search(&self, query: &str) -> Vec<&Conversation> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.conversations.iter().collect();
        }
        self.conversations
            .iter()
            .filter(|c| {
                c.display_title().to_lowercase().contains(&needle)
                    || c.last_message.text.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// Total unread messages across all conversations.
    pub fn total_unread(&self) -> u64 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// Reset `user`'s unread counter. Failures are logged, never raised.
    pub fn mark_read(&self, conversation: &ConversationId, user: &UserId) -> bool {
        mark_read(self.store.as_ref(), &self.config, conversation, user)
    }

    /// Stop listening. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            feed.terminate();
        }
        self.auth_events = None;
    }
}

impl Drop for ConversationDirectory {
    fn drop(&mut self) {
        self.close();
    }
}
