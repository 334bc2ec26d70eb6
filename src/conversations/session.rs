//! The open conversation: resolve-or-create against a peer, live messages,
//! send and delete.

use super::directory::ConversationDirectory;
use super::documents::{decode_message, mark_read, CREATED_AT};
use super::protocol::{append_message, create_conversation, delete_message, DeleteOutcome};
use crate::auth::{AuthEvent, AuthState, Identity};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::feed::{FeedSpec, FeedUpdate, ResilientQuerySubscriber};
use crate::remote::RemoteStore;
use crate::types::{Conversation, ConversationId, Message, MessageId, PeerProfile, UserId};
use crossbeam_channel::Receiver;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Answer to [`ConversationSession::request_peer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRequest {
    /// Resolution will start on the next `poll`.
    Queued,
    /// A resolution for this peer is already in flight.
    AlreadyPending,
    /// The session has been closed.
    Closed,
}

/// Emitted by [`ConversationSession::poll`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    /// A conversation became the active one.
    Opened(Conversation),
    /// Messages of the active conversation, oldest first.
    Messages(Vec<Message>),
    /// Reading the active conversation is not allowed.
    AccessDenied(SyncError),
    /// Non-fatal failure to show to the user (e.g. creation failed).
    Notice(SyncError),
}

/// Result of a creation write, applied on the following turn.
struct Completion {
    peer: UserId,
    result: Result<Conversation>,
}

struct ActiveConversation {
    conversation: Conversation,
    messages: Vec<Message>,
    feed: ResilientQuerySubscriber,
}

/// One user's view of a single open conversation.
///
/// Driven by `poll`, which the host calls on every event-loop turn along
/// with [`ConversationDirectory::poll`].
pub struct ConversationSession {
    store: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
    identity: Option<Identity>,
    auth: Option<AuthState>,
    auth_events: Option<Receiver<AuthEvent>>,

    /// Peers with a resolution in flight. At most one attempt per peer.
    attempted: HashSet<UserId>,
    queued: VecDeque<PeerProfile>,
    completions: Vec<Completion>,

    /// Conversations this session created or resolved, by peer. Covers the
    /// gap before the directory observes a freshly written document.
    resolved: HashMap<UserId, Conversation>,

    active: Option<ActiveConversation>,
    mounted: bool,
}

impl ConversationSession {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        config: Arc<SyncConfig>,
        identity: Option<Identity>,
    ) -> Self {
        Self {
            store,
            config,
            identity,
            auth: None,
            auth_events: None,
            attempted: HashSet::new(),
            queued: VecDeque::new(),
            completions: Vec::new(),
            resolved: HashMap::new(),
            active: None,
            mounted: true,
        }
    }

    /// Track the signed-in user of `auth` from now on.
    ///
    /// Signing out, or in as someone else, drops the active conversation
    /// and every pending resolution of the previous user.
    pub fn follow(&mut self, auth: &AuthState) {
        self.auth_events = Some(auth.watch());
        self.auth = Some(auth.clone());
        self.apply_identity(auth.current());
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    fn apply_identity(&mut self, identity: Option<Identity>) {
        let previous = self.identity.as_ref().map(|i| &i.user_id);
        if previous != identity.as_ref().map(|i| &i.user_id) {
            tracing::debug!(
                previous = ?previous,
                current = ?identity.as_ref().map(|i| &i.user_id),
                "session user changed"
            );
            self.active = None;
            self.attempted.clear();
            self.queued.clear();
            self.completions.clear();
            self.resolved.clear();
        }
        self.identity = identity;
    }

    /// The session's user, provided the followed auth state still agrees.
    fn signed_in(&self) -> Result<&Identity> {
        let identity = self.identity.as_ref().ok_or(SyncError::NotAuthenticated)?;
        if let Some(auth) = &self.auth {
            if auth.user_id().as_ref() != Some(&identity.user_id) {
                return Err(SyncError::NotAuthenticated);
            }
        }
        Ok(identity)
    }

    /// Ask to chat with `peer`. The conversation is found or created during
    /// subsequent polls.
    pub fn request_peer(&mut self, peer: PeerProfile) -> Result<PeerRequest> {
        if !self.mounted {
            return Ok(PeerRequest::Closed);
        }
        let me = &self.signed_in()?.user_id;
        if peer.user_id.as_str().is_empty() {
            return Err(SyncError::MissingField("peer user id"));
        }
        if &peer.user_id == me {
            return Err(SyncError::SelfTarget(me.clone()));
        }

        if !self.attempted.insert(peer.user_id.clone()) {
            tracing::debug!(peer = %peer.user_id, "peer resolution already pending");
            return Ok(PeerRequest::AlreadyPending);
        }
        self.queued.push_back(peer);
        Ok(PeerRequest::Queued)
    }

    /// Whether a resolution for `peer` is in flight.
    pub fn is_pending(&self, peer: &UserId) -> bool {
        self.attempted.contains(peer)
    }

    /// Advance the session by one turn.
    pub fn poll(&mut self, directory: &ConversationDirectory) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        if !self.mounted {
            return updates;
        }

        let latest = self
            .auth_events
            .as_ref()
            .and_then(|events| events.try_iter().last());
        if let Some(event) = latest {
            self.apply_identity(match event {
                AuthEvent::SignedIn(identity) => Some(identity),
                AuthEvent::SignedOut => None,
            });
        }

        for Completion { peer, result } in std::mem::take(&mut self.completions) {
            self.attempted.remove(&peer);
            match result {
                Ok(conversation) => {
                    self.resolved.insert(peer, conversation.clone());
                    self.open(conversation.clone());
                    updates.push(SessionUpdate::Opened(conversation));
                }
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "conversation creation failed");
                    updates.push(SessionUpdate::Notice(err));
                }
            }
        }

        // Only a directory listing this user's conversations can prove that
        // none exists yet
        let directory_ready = directory.is_loaded()
            && self
                .identity
                .as_ref()
                .is_some_and(|i| directory.user() == Some(&i.user_id));
        if directory_ready {
            self.resolve_queued(directory, &mut updates);
        }

        self.forward_messages(&mut updates);
        updates
    }

    fn resolve_queued(&mut self, directory: &ConversationDirectory, updates: &mut Vec<SessionUpdate>) {
        let Some(me) = self.identity.as_ref().map(|i| i.user_id.clone()) else {
            return;
        };

        while let Some(peer) = self.queued.pop_front() {
            let known = directory
                .find_with_peer(&me, &peer.user_id)
                .cloned()
                .or_else(|| self.resolved.get(&peer.user_id).cloned());

            match known {
                Some(conversation) => {
                    self.attempted.remove(&peer.user_id);
                    self.resolved
                        .insert(peer.user_id.clone(), conversation.clone());
                    self.open(conversation.clone());
                    updates.push(SessionUpdate::Opened(conversation));
                }
                None => {
                    let result =
                        create_conversation(self.store.as_ref(), &self.config, &me, &peer);
                    self.completions.push(Completion {
                        peer: peer.user_id,
                        result,
                    });
                }
            }
        }
    }

    fn forward_messages(&mut self, updates: &mut Vec<SessionUpdate>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        for update in active.feed.poll() {
            match update {
                FeedUpdate::Items(docs) => {
                    active.messages = docs.iter().map(decode_message).collect();
                    updates.push(SessionUpdate::Messages(active.messages.clone()));
                }
                FeedUpdate::AccessDenied(err) => updates.push(SessionUpdate::AccessDenied(err)),
                FeedUpdate::Failed(err) => updates.push(SessionUpdate::Notice(err)),
            }
        }
    }

    /// Make `conversation` the active one: watch its messages, oldest first,
    /// and reset the viewer's unread counter.
    pub fn open(&mut self, conversation: Conversation) {
        if !self.mounted {
            return;
        }
        let spec = FeedSpec::new(self.config.messages_path(conversation.id.as_str()), CREATED_AT)
            .ascending();
        // Release the previous feed first
        self.active = None;
        let feed = ResilientQuerySubscriber::watch(self.store.clone(), spec);

        if let Some(identity) = &self.identity {
            mark_read(
                self.store.as_ref(),
                &self.config,
                &conversation.id,
                &identity.user_id,
            );
        }
        tracing::debug!(conversation = %conversation.id, "conversation opened");

        self.active = Some(ActiveConversation {
            conversation,
            messages: Vec::new(),
            feed,
        });
    }

    /// Leave the active conversation.
    pub fn back_to_list(&mut self) {
        self.active = None;
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active.as_ref().map(|a| &a.conversation)
    }

    /// Messages of the active conversation, oldest first.
    pub fn messages(&self) -> &[Message] {
        self.active
            .as_ref()
            .map(|a| a.messages.as_slice())
            .unwrap_or(&[])
    }

    /// Send `text` to the active conversation.
    ///
    /// Validation failures are returned before anything reaches the store.
    pub fn send(&self, conversation: &ConversationId, text: &str) -> Result<MessageId> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let identity = self.signed_in()?;
        let active = self.active_matching(conversation)?;
        append_message(
            self.store.as_ref(),
            &self.config,
            &active.conversation,
            identity,
            text,
        )
    }

    /// Delete a message of the active conversation and recompute its
    /// last-message summary.
    pub fn delete(&self, conversation: &ConversationId, message: &MessageId) -> Result<DeleteOutcome> {
        self.signed_in()?;
        let active = self.active_matching(conversation)?;
        delete_message(
            self.store.as_ref(),
            &self.config,
            &active.conversation.id,
            message,
        )
    }

    fn active_matching(&self, conversation: &ConversationId) -> Result<&ActiveConversation> {
        self.active
            .as_ref()
            .filter(|a| &a.conversation.id == conversation)
            .ok_or(SyncError::NoActiveConversation)
    }

    /// Tear down. Late creation results are discarded. Idempotent.
    pub fn close(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        self.auth_events = None;
        self.active = None;
        self.queued.clear();
        if !self.completions.is_empty() {
            tracing::debug!(
                pending = self.completions.len(),
                "discarding creation results after close"
            );
        }
        self.completions.clear();
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversationIdStrategy;
    use crate::remote::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        directory: ConversationDirectory,
        session: ConversationSession,
    }

    fn fixture(user: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(SyncConfig::default());
        let mut directory = ConversationDirectory::new(store.clone(), config.clone());
        directory.set_user(Some(UserId::from(user)));
        directory.poll();
        let session = ConversationSession::new(
            store.clone(),
            config,
            Some(Identity::new(user).with_display_name(user.to_uppercase())),
        );
        Fixture {
            store,
            directory,
            session,
        }
    }

    fn opened(updates: &[SessionUpdate]) -> Option<&Conversation> {
        updates.iter().find_map(|u| match u {
            SessionUpdate::Opened(c) => Some(c),
            _ => None,
        })
    }

    #[test]
    fn test_request_validation() {
        let mut fx = fixture("u1");
        assert_eq!(
            fx.session.request_peer(PeerProfile::new("u1")),
            Err(SyncError::SelfTarget(UserId::from("u1")))
        );
        assert_eq!(
            fx.session.request_peer(PeerProfile::new("")),
            Err(SyncError::MissingField("peer user id"))
        );

        let mut anonymous =
            ConversationSession::new(fx.store.clone(), Arc::new(SyncConfig::default()), None);
        assert_eq!(
            anonymous.request_peer(PeerProfile::new("u2")),
            Err(SyncError::NotAuthenticated)
        );
    }

    #[test]
    fn test_create_then_open_on_next_turn() {
        let mut fx = fixture("u1");
        assert_eq!(
            fx.session.request_peer(PeerProfile::new("u2").with_name("Binh")),
            Ok(PeerRequest::Queued)
        );

        // First turn writes, second turn opens
        assert!(fx.session.poll(&fx.directory).is_empty());
        assert_eq!(fx.store.stats().created_in("conversations"), 1);

        let updates = fx.session.poll(&fx.directory);
        let conv = opened(&updates).unwrap();
        assert_eq!(conv.title.as_deref(), Some("Binh"));
        assert!(updates.contains(&SessionUpdate::Messages(vec![])));
        assert_eq!(fx.session.active().map(|c| &c.id), Some(&conv.id));
        assert!(!fx.session.is_pending(&UserId::from("u2")));
    }

    #[test]
    fn test_repeated_request_is_guarded() {
        let mut fx = fixture("u1");
        assert_eq!(fx.session.request_peer(PeerProfile::new("u2")), Ok(PeerRequest::Queued));
        assert_eq!(
            fx.session.request_peer(PeerProfile::new("u2")),
            Ok(PeerRequest::AlreadyPending)
        );
        fx.session.poll(&fx.directory);
        assert_eq!(
            fx.session.request_peer(PeerProfile::new("u2")),
            Ok(PeerRequest::AlreadyPending)
        );
        fx.session.poll(&fx.directory);

        // Resolved; the directory has not caught up yet but nothing is rewritten
        assert_eq!(fx.session.request_peer(PeerProfile::new("u2")), Ok(PeerRequest::Queued));
        let updates = fx.session.poll(&fx.directory);
        assert!(opened(&updates).is_some());
        assert_eq!(fx.store.stats().created_in("conversations"), 1);
    }

    #[test]
    fn test_existing_conversation_is_reused() {
        let mut fx = fixture("u1");
        fx.session.request_peer(PeerProfile::new("u2")).unwrap();
        fx.session.poll(&fx.directory);
        fx.session.poll(&fx.directory);
        fx.directory.poll();

        let mut other = ConversationSession::new(
            fx.store.clone(),
            Arc::new(SyncConfig::default()),
            Some(Identity::new("u1")),
        );
        other.request_peer(PeerProfile::new("u2")).unwrap();
        let updates = other.poll(&fx.directory);
        assert!(opened(&updates).is_some());
        assert_eq!(fx.store.stats().created_in("conversations"), 1);
    }

    #[test]
    fn test_waits_for_directory() {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(SyncConfig::default());
        let mut directory = ConversationDirectory::new(store.clone(), config.clone());
        directory.set_user(Some(UserId::from("u1")));
        let mut session =
            ConversationSession::new(store.clone(), config, Some(Identity::new("u1")));

        session.request_peer(PeerProfile::new("u2")).unwrap();
        session.poll(&directory);
        assert_eq!(store.stats().created_in("conversations"), 0);

        directory.poll();
        session.poll(&directory);
        assert_eq!(store.stats().created_in("conversations"), 1);
    }

    #[test]
    fn test_unsubscribed_directory_is_not_trusted() {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(SyncConfig {
            conversation_ids: ConversationIdStrategy::Random,
            ..Default::default()
        });
        let existing =
            create_conversation(&*store, &config, &UserId::from("u1"), &PeerProfile::new("u2"))
                .unwrap();
        let auth = AuthState::signed_in(Identity::new("u1"));

        // Followed but not yet polled: no user, nothing listed
        let mut directory = ConversationDirectory::new(store.clone(), config.clone());
        directory.follow(&auth);
        let mut session = ConversationSession::new(store.clone(), config.clone(), None);
        session.follow(&auth);

        session.request_peer(PeerProfile::new("u2")).unwrap();
        assert!(session.poll(&directory).is_empty());
        assert_eq!(store.document_count("conversations"), 1);

        // Loaded, but for someone else
        let mut foreign = ConversationDirectory::new(store.clone(), config);
        foreign.set_user(Some(UserId::from("u3")));
        foreign.poll();
        assert!(session.poll(&foreign).is_empty());
        assert_eq!(store.document_count("conversations"), 1);

        directory.poll();
        let updates = session.poll(&directory);
        assert_eq!(opened(&updates).map(|c| &c.id), Some(&existing.id));
        assert_eq!(store.document_count("conversations"), 1);
    }

    #[test]
    fn test_sign_out_blocks_writes_and_resets() {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(SyncConfig::default());
        let auth = AuthState::signed_in(Identity::new("u1"));
        let mut directory = ConversationDirectory::new(store.clone(), config.clone());
        directory.follow(&auth);
        directory.poll();
        let mut session = ConversationSession::new(store.clone(), config, None);
        session.follow(&auth);

        session.request_peer(PeerProfile::new("u2")).unwrap();
        session.poll(&directory);
        session.poll(&directory);
        let cid = session.active().unwrap().id.clone();
        let sent = session.send(&cid, "hello").unwrap();
        session.request_peer(PeerProfile::new("u3")).unwrap();
        let commits = store.stats().commits;

        // Writes stop as soon as the user signs out, before any poll
        auth.sign_out();
        assert_eq!(session.send(&cid, "too late"), Err(SyncError::NotAuthenticated));
        assert_eq!(session.delete(&cid, &sent), Err(SyncError::NotAuthenticated));
        assert_eq!(
            session.request_peer(PeerProfile::new("u4")),
            Err(SyncError::NotAuthenticated)
        );
        assert_eq!(store.stats().commits, commits);

        directory.poll();
        assert!(session.poll(&directory).is_empty());
        assert!(session.identity().is_none());
        assert!(session.active().is_none());
        assert!(!session.is_pending(&UserId::from("u3")));
        assert_eq!(store.live_query_count(), 0);
        assert_eq!(store.document_count("conversations"), 1);

        // The peer signs in on the same device and finds the conversation
        auth.sign_in(Identity::new("u2"));
        directory.poll();
        session.poll(&directory);
        assert_eq!(session.request_peer(PeerProfile::new("u1")), Ok(PeerRequest::Queued));
        let updates = session.poll(&directory);
        assert_eq!(opened(&updates).map(|c| &c.id), Some(&cid));
        assert_eq!(store.document_count("conversations"), 1);
    }

    #[test]
    fn test_send_validation_order() {
        let mut fx = fixture("u1");
        let cid = ConversationId::from("c1");
        assert_eq!(fx.session.send(&cid, "   "), Err(SyncError::EmptyMessage));
        assert_eq!(fx.session.send(&cid, "hi"), Err(SyncError::NoActiveConversation));

        fx.session.request_peer(PeerProfile::new("u2")).unwrap();
        fx.session.poll(&fx.directory);
        fx.session.poll(&fx.directory);
        let commits = fx.store.stats().commits;
        assert_eq!(fx.session.send(&cid, "hi"), Err(SyncError::NoActiveConversation));
        assert_eq!(
            fx.session.delete(&cid, &MessageId::from("m1")),
            Err(SyncError::NoActiveConversation)
        );

        let anonymous =
            ConversationSession::new(fx.store.clone(), Arc::new(SyncConfig::default()), None);
        assert_eq!(anonymous.send(&cid, "hi"), Err(SyncError::NotAuthenticated));
        assert_eq!(fx.store.stats().commits, commits);
    }

    #[test]
    fn test_send_and_delete_flow_through_feed() {
        let mut fx = fixture("u1");
        fx.session.request_peer(PeerProfile::new("u2")).unwrap();
        fx.session.poll(&fx.directory);
        fx.session.poll(&fx.directory);
        let cid = fx.session.active().unwrap().id.clone();

        let first = fx.session.send(&cid, "hello").unwrap();
        fx.session.send(&cid, "how are you").unwrap();
        fx.session.poll(&fx.directory);
        let texts: Vec<&str> = fx.session.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "how are you"]);
        assert_eq!(fx.session.messages()[0].sender_name.as_deref(), Some("U1"));

        let outcome = fx.session.delete(&cid, &first).unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted { last_message: Some(_) }));
        fx.session.poll(&fx.directory);
        assert_eq!(fx.session.messages().len(), 1);
    }

    #[test]
    fn test_failed_creation_releases_guard() {
        let mut fx = fixture("u1");
        fx.store.deny_writes("conversations");
        fx.session.request_peer(PeerProfile::new("u2")).unwrap();
        fx.session.poll(&fx.directory);

        let updates = fx.session.poll(&fx.directory);
        assert!(matches!(updates.as_slice(), [SessionUpdate::Notice(e)] if e.is_permission()));
        assert!(fx.session.active().is_none());

        fx.store.allow_all();
        assert_eq!(fx.session.request_peer(PeerProfile::new("u2")), Ok(PeerRequest::Queued));
        fx.session.poll(&fx.directory);
        assert!(opened(&fx.session.poll(&fx.directory)).is_some());
    }

    #[test]
    fn test_close_discards_late_completion() {
        let mut fx = fixture("u1");
        fx.session.request_peer(PeerProfile::new("u2")).unwrap();
        fx.session.poll(&fx.directory);

        fx.session.close();
        fx.session.close();
        assert!(fx.session.poll(&fx.directory).is_empty());
        assert!(fx.session.active().is_none());
        // Only the directory's listener remains
        assert_eq!(fx.store.live_query_count(), 1);
        assert_eq!(
            fx.session.request_peer(PeerProfile::new("u3")),
            Ok(PeerRequest::Closed)
        );
    }

    #[test]
    fn test_switching_conversation_releases_feed() {
        let mut fx = fixture("u1");
        fx.session.request_peer(PeerProfile::new("u2")).unwrap();
        fx.session.request_peer(PeerProfile::new("u3")).unwrap();
        fx.session.poll(&fx.directory);
        fx.session.poll(&fx.directory);

        // Directory listener plus one message feed
        assert_eq!(fx.store.live_query_count(), 2);
        fx.session.back_to_list();
        assert_eq!(fx.store.live_query_count(), 1);
        assert!(fx.session.messages().is_empty());
    }
}
