//! One-to-one conversations.
//!
//! - [`ConversationDirectory`]: live list of a user's conversations, each with
//!   that user's own unread count.
//! - [`ConversationSession`]: the open conversation. Resolves or creates the
//!   conversation with a peer at most once, sends (message + summary +
//!   counters in one transaction) and deletes (with summary recomputation).
//!
//! Document layout:
//!
//! ```text
//! conversations/{id}
//!     memberIds, title, peerId, peerName, peerAvatar,
//!     createdAt, updatedAt,
//!     lastMessageText, lastSenderId, lastSenderName, lastMessageId,
//!     unread_{uid} (one per member)
//! conversations/{id}/messages/{id}
//!     text, senderId, senderName, createdAt
//! ```

mod directory;
mod documents;
mod protocol;
mod session;

pub use directory::{ConversationDirectory, DirectoryUpdate};
pub use documents::{
    conversation_path, decode_conversation, decode_message, mark_read, message_path,
    pair_conversation_id,
};
pub use protocol::{append_message, create_conversation, delete_message, DeleteOutcome};
pub use session::{ConversationSession, PeerRequest, SessionUpdate};
