//! # Marketplace Sync
//!
//! Client-side real-time synchronization core for a freelance marketplace:
//! live job and freelancer feeds plus one-to-one chat, on top of a remote
//! real-time document store.
//!
//! ## Core Concepts
//!
//! - **Feeds**: Live queries that fall back to client-side ordering when the
//!   store cannot serve the ordered query
//! - **Directory**: A user's conversations, newest first, with per-user unread counts
//! - **Session**: The open conversation with guarded creation, transactional
//!   send and delete with summary recomputation
//! - **Remote store**: The narrow store interface everything runs against
//!
//! ## Example
//!
//! ```ignore
//! use marketplace_sync::{
//!     AuthState, ConversationDirectory, ConversationSession, Identity, MemoryStore,
//!     PeerProfile, SyncConfig,
//! };
//!
//! let config = Arc::new(SyncConfig::default());
//! let store = Arc::new(MemoryStore::from_config(&config));
//! let auth = AuthState::signed_in(Identity::new("u1"));
//!
//! let mut directory = ConversationDirectory::new(store.clone(), config.clone());
//! directory.follow(&auth);
//!
//! let mut session = ConversationSession::new(store, config, None);
//! session.follow(&auth);
//! session.request_peer(PeerProfile::new("u2").with_name("Binh"))?;
//!
//! // Every event-loop turn
//! directory.poll();
//! for update in session.poll(&directory) {
//!     // render
//! }
//! ```

pub mod applications;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod error;
pub mod feed;
pub mod remote;
pub mod types;

// Re-exports
pub use applications::{submit_application, ApplicationForm, ApplicationOutcome, JobRef};
pub use auth::{load_display_name, resolve_display_name, AuthEvent, AuthState, Identity};
pub use config::{ConversationIdStrategy, SyncConfig};
pub use conversations::{
    append_message, create_conversation, delete_message, mark_read, ConversationDirectory,
    ConversationSession, DeleteOutcome, DirectoryUpdate, PeerRequest, SessionUpdate,
};
pub use error::{ErrorClass, Result, StoreErrorKind, SyncError};
pub use feed::{FeedSpec, FeedState, FeedUpdate, ResilientQuerySubscriber};
pub use remote::{
    Direction, Document, DocumentPath, Fields, Filter, MemoryStore, Query, QueryEvent,
    RemoteStore, Transaction,
};
pub use types::{
    Conversation, ConversationId, LastMessage, Message, MessageId, PeerProfile, Timestamp, UserId,
};
