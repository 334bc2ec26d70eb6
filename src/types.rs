//! Core types shared by the feed and conversation subsystems.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque user identifier issued by the auth provider.
    UserId
);
string_id!(
    /// Identifier of a conversation document.
    ConversationId
);
string_id!(
    /// Identifier of a message document inside a conversation.
    MessageId
);

/// Microseconds since Unix epoch.
///
/// Values stored in documents are assigned by the store at commit time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }

    pub fn next(self) -> Self {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Denormalized summary of the most recent message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    pub message_id: String,
}

impl LastMessage {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.sender_id.is_empty()
    }
}

/// A one-to-one conversation as seen by one of its participants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,

    /// The two participants, in creation order.
    pub member_ids: Vec<UserId>,

    pub title: Option<String>,

    // Cached peer fields, written from the creator's perspective. Advisory
    // only; never used to identify anyone.
    pub peer_id: Option<String>,
    pub peer_name: Option<String>,
    pub peer_avatar: Option<String>,

    pub last_message: LastMessage,

    /// None until the store has stamped the document.
    pub updated_at: Option<Timestamp>,

    /// The viewer's own unread counter.
    pub unread_count: u64,
}

impl Conversation {
    /// The other participant, derived from `member_ids`.
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        self.member_ids.iter().find(|id| *id != me && !id.0.is_empty())
    }

    pub fn has_members(&self, a: &UserId, b: &UserId) -> bool {
        self.member_ids.contains(a) && self.member_ids.contains(b)
    }

    /// Label shown in lists: title, then cached peer name.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.peer_name.as_deref().filter(|n| !n.is_empty()))
            .unwrap_or("Everyone")
    }
}

/// A single chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender_id: UserId,
    /// Sender name at send time; not updated on rename.
    pub sender_name: Option<String>,
    pub created_at: Option<Timestamp>,
}

/// Someone the current user wants to talk to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub user_id: UserId,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

impl PeerProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            name: None,
            avatar: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}
