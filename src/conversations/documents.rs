//! Encoding of conversation and message documents.

use crate::config::SyncConfig;
use crate::remote::{Document, DocumentPath, Fields, RemoteStore};
use crate::types::{
    Conversation, ConversationId, LastMessage, Message, MessageId, PeerProfile, UserId,
};
use serde_json::Value;
use sha2::{Digest, Sha256};

// Conversation fields
pub(crate) const MEMBER_IDS: &str = "memberIds";
pub(crate) const TITLE: &str = "title";
pub(crate) const PEER_ID: &str = "peerId";
pub(crate) const PEER_NAME: &str = "peerName";
pub(crate) const PEER_AVATAR: &str = "peerAvatar";
pub(crate) const CREATED_AT: &str = "createdAt";
pub(crate) const UPDATED_AT: &str = "updatedAt";
pub(crate) const LAST_MESSAGE_TEXT: &str = "lastMessageText";
pub(crate) const LAST_SENDER_ID: &str = "lastSenderId";
pub(crate) const LAST_SENDER_NAME: &str = "lastSenderName";
pub(crate) const LAST_MESSAGE_ID: &str = "lastMessageId";

// Message fields
pub(crate) const TEXT: &str = "text";
pub(crate) const SENDER_ID: &str = "senderId";
pub(crate) const SENDER_NAME: &str = "senderName";

pub fn conversation_path(config: &SyncConfig, id: &ConversationId) -> DocumentPath {
    DocumentPath::new(config.conversations_collection.clone(), id.0.clone())
}

pub fn message_path(config: &SyncConfig, conversation: &ConversationId, id: &MessageId) -> DocumentPath {
    DocumentPath::new(config.messages_path(conversation.as_str()), id.0.clone())
}

/// Conversation id derived from the unordered member pair.
pub fn pair_conversation_id(a: &UserId, b: &UserId) -> ConversationId {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(first.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(second.as_str().as_bytes());
    ConversationId(hex::encode(hasher.finalize()))
}

/// Decode a conversation document as seen by `viewer`.
///
/// Only the viewer's own unread counter is read.
pub fn decode_conversation(doc: &Document, viewer: &UserId, config: &SyncConfig) -> Conversation {
    let member_ids = doc
        .get(MEMBER_IDS)
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(UserId::from)
                .collect()
        })
        .unwrap_or_default();

    let owned = |field: &str| doc.get_str(field).map(str::to_string);

    Conversation {
        id: ConversationId(doc.id.clone()),
        member_ids,
        title: owned(TITLE),
        peer_id: owned(PEER_ID),
        peer_name: owned(PEER_NAME),
        peer_avatar: owned(PEER_AVATAR),
        last_message: LastMessage {
            text: owned(LAST_MESSAGE_TEXT).unwrap_or_default(),
            sender_id: owned(LAST_SENDER_ID).unwrap_or_default(),
            sender_name: owned(LAST_SENDER_NAME).unwrap_or_default(),
            message_id: owned(LAST_MESSAGE_ID).unwrap_or_default(),
        },
        updated_at: doc.get_timestamp(UPDATED_AT),
        unread_count: doc
            .get_u64(&config.unread_field(viewer.as_str()))
            .unwrap_or(0),
    }
}

pub fn decode_message(doc: &Document) -> Message {
    Message {
        id: MessageId(doc.id.clone()),
        text: doc.get_str(TEXT).unwrap_or_default().to_string(),
        sender_id: UserId::new(doc.get_str(SENDER_ID).unwrap_or_default()),
        sender_name: doc.get_str(SENDER_NAME).map(str::to_string),
        created_at: doc.get_timestamp(CREATED_AT),
    }
}

/// Fields of a brand-new conversation between `me` and `peer`.
pub fn new_conversation_fields(config: &SyncConfig, me: &UserId, peer: &PeerProfile) -> Fields {
    let peer_name = peer.name.clone().unwrap_or_default();
    let title = peer
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Chat".to_string());
    let avatar = peer.avatar.clone().map(Value::from).unwrap_or(Value::Null);

    Fields::new()
        .set(
            MEMBER_IDS,
            vec![Value::from(me.as_str()), Value::from(peer.user_id.as_str())],
        )
        .set(TITLE, title)
        .set(PEER_ID, peer.user_id.as_str())
        .set(PEER_NAME, peer_name)
        .set(PEER_AVATAR, avatar)
        .server_timestamp(CREATED_AT)
        .server_timestamp(UPDATED_AT)
        .set(LAST_MESSAGE_TEXT, "")
        .set(LAST_SENDER_ID, "")
        .set(LAST_SENDER_NAME, "")
        .set(LAST_MESSAGE_ID, "")
        .set(config.unread_field(me.as_str()), 0)
        .set(config.unread_field(peer.user_id.as_str()), 0)
}

/// Local view of a conversation that was just written, before the store
/// echoes it back.
pub fn local_conversation(id: ConversationId, me: &UserId, peer: &PeerProfile) -> Conversation {
    Conversation {
        id,
        member_ids: vec![me.clone(), peer.user_id.clone()],
        title: Some(
            peer.name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Chat".to_string()),
        ),
        peer_id: Some(peer.user_id.0.clone()),
        peer_name: peer.name.clone(),
        peer_avatar: peer.avatar.clone(),
        last_message: LastMessage::default(),
        updated_at: None,
        unread_count: 0,
    }
}

impl PeerProfile {
    /// Extract a chat peer from a freelancer or job record.
    ///
    /// The peer identifier is taken from `ownerUid`, then `uid`, then `userId`.
    pub fn from_document(doc: &Document) -> Option<Self> {
        let user_id = ["ownerUid", "uid", "userId"]
            .into_iter()
            .find_map(|field| doc.get_str(field))?;
        Some(PeerProfile {
            user_id: UserId::new(user_id),
            name: doc.get_str("name").map(str::to_string),
            avatar: doc.get_str("avatar").map(str::to_string),
        })
    }
}

/// Reset `user`'s unread counter on a conversation.
///
/// Best effort: failures are logged and reported as `false`, never raised.
pub fn mark_read(
    store: &dyn RemoteStore,
    config: &SyncConfig,
    conversation: &ConversationId,
    user: &UserId,
) -> bool {
    let fields = Fields::new().set(config.unread_field(user.as_str()), 0);
    match store.update(&conversation_path(config, conversation), fields) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(
                conversation = %conversation,
                user = %user,
                error = %err,
                "mark read failed"
            );
            false
        }
    }
}
