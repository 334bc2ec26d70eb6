//! Store-side steps of the conversation protocol: create, send, delete.
//!
//! These are free functions over `&dyn RemoteStore` so the session and any
//! other caller (background jobs, tests driving many senders) share one
//! implementation.

use super::documents::{
    conversation_path, decode_conversation, decode_message, local_conversation, message_path,
    new_conversation_fields, pair_conversation_id, CREATED_AT, LAST_MESSAGE_ID,
    LAST_MESSAGE_TEXT, LAST_SENDER_ID, LAST_SENDER_NAME, SENDER_ID, SENDER_NAME, TEXT,
    UPDATED_AT,
};
use crate::auth::Identity;
use crate::config::{ConversationIdStrategy, SyncConfig};
use crate::error::{Result, StoreErrorKind, SyncError};
use crate::remote::{sort_documents, Direction, Fields, Query, RemoteStore, Transaction};
use crate::types::{Conversation, ConversationId, Message, MessageId, PeerProfile, UserId};

/// Result of deleting a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Deleted; the conversation summary now shows `last_message`
    /// (None when the conversation is empty).
    Deleted { last_message: Option<Message> },
    /// The message was already gone; nothing changed.
    AlreadyGone,
}

/// Write a new conversation between `me` and `peer`.
///
/// With pair-derived ids the write is create-if-absent: if the document
/// already exists (the peer created it first) it is returned instead.
pub fn create_conversation(
    store: &dyn RemoteStore,
    config: &SyncConfig,
    me: &UserId,
    peer: &PeerProfile,
) -> Result<Conversation> {
    if peer.user_id.as_str().is_empty() {
        return Err(SyncError::MissingField("peer user id"));
    }
    if &peer.user_id == me {
        return Err(SyncError::SelfTarget(me.clone()));
    }

    let fields = new_conversation_fields(config, me, peer);

    match config.conversation_ids {
        ConversationIdStrategy::PairDerived => {
            let id = pair_conversation_id(me, &peer.user_id);
            let path = conversation_path(config, &id);
            match store.create(&path, fields) {
                Ok(()) => {
                    tracing::info!(conversation = %id, peer = %peer.user_id, "conversation created");
                    Ok(local_conversation(id, me, peer))
                }
                Err(err) if err.store_kind() == Some(StoreErrorKind::AlreadyExists) => {
                    tracing::debug!(conversation = %id, "conversation already exists, reusing");
                    let doc = store
                        .get_document(&path)?
                        .ok_or_else(|| SyncError::ConversationNotFound(id.clone()))?;
                    Ok(decode_conversation(&doc, me, config))
                }
                Err(err) => Err(err),
            }
        }
        ConversationIdStrategy::Random => {
            let id = ConversationId(store.new_document_id(&config.conversations_collection));
            store.set(&conversation_path(config, &id), fields)?;
            tracing::info!(conversation = %id, peer = %peer.user_id, "conversation created");
            Ok(local_conversation(id, me, peer))
        }
    }
}

/// Append a message and update the conversation summary in one transaction.
///
/// The recipient is whoever in `member_ids` is not the sender; their
/// counter gets a server-side `+1`, the sender's is reset to zero.
pub fn append_message(
    store: &dyn RemoteStore,
    config: &SyncConfig,
    conversation: &Conversation,
    sender: &Identity,
    text: &str,
) -> Result<MessageId> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SyncError::EmptyMessage);
    }

    let me = &sender.user_id;
    let recipient = conversation.peer_of(me).cloned();
    let sender_name = sender.sender_name();

    let conv_path = conversation_path(config, &conversation.id);
    let message_id = MessageId(store.new_document_id(&config.messages_path(conversation.id.as_str())));
    let msg_path = message_path(config, &conversation.id, &message_id);

    store.run_transaction(&mut |tx: &mut dyn Transaction| {
        tx.set(
            &msg_path,
            Fields::new()
                .set(TEXT, text)
                .set(SENDER_ID, me.as_str())
                .set(SENDER_NAME, sender_name.clone())
                .server_timestamp(CREATED_AT),
        );

        let mut summary = Fields::new()
            .set(LAST_MESSAGE_TEXT, text)
            .set(LAST_SENDER_ID, me.as_str())
            .set(LAST_SENDER_NAME, sender_name.clone())
            .set(LAST_MESSAGE_ID, message_id.as_str())
            .server_timestamp(UPDATED_AT)
            .set(config.unread_field(me.as_str()), 0);
        if let Some(recipient) = &recipient {
            summary = summary.increment(config.unread_field(recipient.as_str()), 1);
        }
        tx.update(&conv_path, summary);
        Ok(())
    })?;

    tracing::debug!(conversation = %conversation.id, message = %message_id, "message sent");
    Ok(message_id)
}

/// Latest remaining message of a conversation, if any.
fn latest_message(
    store: &dyn RemoteStore,
    config: &SyncConfig,
    conversation: &ConversationId,
) -> Result<Option<Message>> {
    let collection = config.messages_path(conversation.as_str());
    let ordered = Query::collection(collection.clone())
        .order_by(CREATED_AT, Direction::Descending)
        .limit(1);

    let mut docs = match store.get(&ordered) {
        Ok(docs) => docs,
        Err(err) if err.is_capability() => {
            tracing::debug!(conversation = %conversation, error = %err, "ordered lookup rejected, sorting locally");
            let mut docs = store.get(&Query::collection(collection))?;
            sort_documents(&mut docs, CREATED_AT, Direction::Descending);
            docs
        }
        Err(err) => return Err(err),
    };
    docs.truncate(1);
    Ok(docs.first().map(decode_message))
}

/// Delete a message and recompute the conversation's last-message summary.
///
/// Not transactional: a send racing with this may briefly leave a stale
/// summary until the next write.
pub fn delete_message(
    store: &dyn RemoteStore,
    config: &SyncConfig,
    conversation: &ConversationId,
    message: &MessageId,
) -> Result<DeleteOutcome> {
    let msg_path = message_path(config, conversation, message);
    if store.get_document(&msg_path)?.is_none() {
        return Ok(DeleteOutcome::AlreadyGone);
    }
    store.delete(&msg_path)?;

    let last = latest_message(store, config, conversation)?;
    let fields = match &last {
        None => Fields::new()
            .set(LAST_MESSAGE_TEXT, "")
            .set(LAST_SENDER_ID, "")
            .set(LAST_SENDER_NAME, "")
            .set(LAST_MESSAGE_ID, "")
            .server_timestamp(UPDATED_AT),
        Some(remaining) => {
            let fields = Fields::new()
                .set(LAST_MESSAGE_TEXT, remaining.text.clone())
                .set(LAST_SENDER_ID, remaining.sender_id.as_str())
                .set(
                    LAST_SENDER_NAME,
                    remaining.sender_name.clone().unwrap_or_default(),
                )
                .set(LAST_MESSAGE_ID, remaining.id.as_str());
            // Keep the remaining message's own time so directory recency
            // stays truthful
            match remaining.created_at {
                Some(at) => fields.set(UPDATED_AT, at.0),
                None => fields.server_timestamp(UPDATED_AT),
            }
        }
    };
    store.update(&conversation_path(config, conversation), fields)?;

    tracing::debug!(conversation = %conversation, message = %message, "message deleted");
    Ok(DeleteOutcome::Deleted { last_message: last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;

    fn setup(strategy: ConversationIdStrategy) -> (MemoryStore, SyncConfig, Conversation) {
        let store = MemoryStore::new();
        let config = SyncConfig {
            conversation_ids: strategy,
            ..Default::default()
        };
        let conv = create_conversation(
            &store,
            &config,
            &UserId::from("u1"),
            &PeerProfile::new("u2")
                .with_name("Binh")
                .with_avatar("avatars/u2.png"),
        )
        .unwrap();
        (store, config, conv)
    }

    fn conversation_doc(store: &MemoryStore, config: &SyncConfig, id: &ConversationId) -> crate::remote::Document {
        store
            .get_document(&conversation_path(config, id))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_create_initializes_counters() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);
        let doc = conversation_doc(&store, &config, &conv.id);
        assert_eq!(doc.get_u64("unread_u1"), Some(0));
        assert_eq!(doc.get_u64("unread_u2"), Some(0));
        assert_eq!(doc.get_str("title"), Some("Binh"));
        assert_eq!(doc.get_str("peerAvatar"), Some("avatars/u2.png"));
        assert_eq!(conv.peer_avatar.as_deref(), Some("avatars/u2.png"));
        assert!(doc.get_timestamp("updatedAt").is_some());
        assert_eq!(conv.member_ids, vec![UserId::from("u1"), UserId::from("u2")]);
    }

    #[test]
    fn test_pair_derived_create_reuses_existing() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);

        // The peer opens the chat from the other side
        let again = create_conversation(
            &store,
            &config,
            &UserId::from("u2"),
            &PeerProfile::new("u1"),
        )
        .unwrap();

        assert_eq!(again.id, conv.id);
        assert_eq!(store.document_count("conversations"), 1);
    }

    #[test]
    fn test_random_ids_keep_the_race() {
        let (store, config, conv) = setup(ConversationIdStrategy::Random);
        let other = create_conversation(
            &store,
            &config,
            &UserId::from("u2"),
            &PeerProfile::new("u1"),
        )
        .unwrap();
        assert_ne!(other.id, conv.id);
        assert_eq!(store.document_count("conversations"), 2);
    }

    #[test]
    fn test_create_rejects_self() {
        let store = MemoryStore::new();
        let result = create_conversation(
            &store,
            &SyncConfig::default(),
            &UserId::from("u1"),
            &PeerProfile::new("u1"),
        );
        assert!(matches!(result, Err(SyncError::SelfTarget(_))));
        assert_eq!(store.stats().commits, 0);
    }

    #[test]
    fn test_append_updates_summary_and_counters() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);
        let sender = Identity::new("u1").with_display_name("An");

        let id = append_message(&store, &config, &conv, &sender, "  hello  ").unwrap();

        let doc = conversation_doc(&store, &config, &conv.id);
        assert_eq!(doc.get_str("lastMessageText"), Some("hello"));
        assert_eq!(doc.get_str("lastSenderName"), Some("An"));
        assert_eq!(doc.get_str("lastMessageId"), Some(id.as_str()));
        assert_eq!(doc.get_u64("unread_u2"), Some(1));
        assert_eq!(doc.get_u64("unread_u1"), Some(0));

        let msg = store
            .get_document(&message_path(&config, &conv.id, &id))
            .unwrap()
            .unwrap();
        assert_eq!(msg.get_str("text"), Some("hello"));
        assert_eq!(msg.get_timestamp("createdAt"), doc.get_timestamp("updatedAt"));
    }

    #[test]
    fn test_append_rejects_blank_without_store_calls() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);
        let commits = store.stats().commits;
        let result = append_message(&store, &config, &conv, &Identity::new("u1"), " \n\t ");
        assert_eq!(result, Err(SyncError::EmptyMessage));
        assert_eq!(store.stats().commits, commits);
    }

    #[test]
    fn test_delete_only_message_clears_summary() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);
        let id = append_message(&store, &config, &conv, &Identity::new("u1"), "hi").unwrap();

        let outcome = delete_message(&store, &config, &conv.id, &id).unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted { last_message: None });

        let doc = conversation_doc(&store, &config, &conv.id);
        assert_eq!(doc.get_str("lastMessageText"), None);
        assert_eq!(doc.get_str("lastSenderId"), None);
    }

    #[test]
    fn test_delete_latest_restores_previous_with_its_time() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);
        let sender = Identity::new("u1");
        let first = append_message(&store, &config, &conv, &sender, "first").unwrap();
        let second = append_message(&store, &config, &conv, &sender, "second").unwrap();

        let first_doc = store
            .get_document(&message_path(&config, &conv.id, &first))
            .unwrap()
            .unwrap();

        delete_message(&store, &config, &conv.id, &second).unwrap();

        let doc = conversation_doc(&store, &config, &conv.id);
        assert_eq!(doc.get_str("lastMessageText"), Some("first"));
        assert_eq!(doc.get_str("lastMessageId"), Some(first.as_str()));
        assert_eq!(
            doc.get_timestamp("updatedAt"),
            first_doc.get_timestamp("createdAt")
        );
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);
        let commits = store.stats().commits;
        let outcome = delete_message(&store, &config, &conv.id, &MessageId::from("ghost")).unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyGone);
        assert_eq!(store.stats().commits, commits);
    }

    #[test]
    fn test_delete_recompute_survives_unorderable_messages() {
        let (store, config, conv) = setup(ConversationIdStrategy::PairDerived);
        let sender = Identity::new("u1");
        append_message(&store, &config, &conv, &sender, "a").unwrap();
        let b = append_message(&store, &config, &conv, &sender, "b").unwrap();
        append_message(&store, &config, &conv, &sender, "c").unwrap();
        store.set_unorderable("messages", true);

        let c_id = conversation_doc(&store, &config, &conv.id)
            .get_str("lastMessageId")
            .map(str::to_string)
            .unwrap();
        delete_message(&store, &config, &conv.id, &MessageId(c_id)).unwrap();

        let doc = conversation_doc(&store, &config, &conv.id);
        assert_eq!(doc.get_str("lastMessageId"), Some(b.as_str()));
    }
}
