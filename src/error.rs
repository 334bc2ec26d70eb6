//! Error types for the synchronization layer.

use crate::types::{ConversationId, UserId};
use thiserror::Error;

/// Status reported by the remote store for a failed call.
///
/// Mirrors the canonical status codes of real-time document stores; only the
/// ones the core branches on are distinguished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Query needs server-side configuration (e.g. a composite index).
    FailedPrecondition,
    /// Query shape rejected (e.g. unsupported filter/order pairing).
    InvalidArgument,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    /// Transaction aborted; nothing was applied.
    Aborted,
    Unavailable,
    Internal,
}

impl StoreErrorKind {
    /// Wire code as used by the store's error payloads.
    pub fn code(self) -> &'static str {
        match self {
            StoreErrorKind::FailedPrecondition => "failed-precondition",
            StoreErrorKind::InvalidArgument => "invalid-argument",
            StoreErrorKind::PermissionDenied => "permission-denied",
            StoreErrorKind::NotFound => "not-found",
            StoreErrorKind::AlreadyExists => "already-exists",
            StoreErrorKind::Aborted => "aborted",
            StoreErrorKind::Unavailable => "unavailable",
            StoreErrorKind::Internal => "internal",
        }
    }

    /// Classify a raw store error by scanning its code and message.
    ///
    /// Store SDKs are inconsistent about where the status ends up (code,
    /// native code, or only the message text), so both are searched.
    pub fn detect(code: &str, message: &str) -> Self {
        let hay = format!("{} {}", code.to_lowercase(), message.to_lowercase());
        const KINDS: [StoreErrorKind; 8] = [
            StoreErrorKind::FailedPrecondition,
            StoreErrorKind::InvalidArgument,
            StoreErrorKind::PermissionDenied,
            StoreErrorKind::NotFound,
            StoreErrorKind::AlreadyExists,
            StoreErrorKind::Aborted,
            StoreErrorKind::Unavailable,
            StoreErrorKind::Internal,
        ];
        KINDS
            .into_iter()
            .find(|kind| hay.contains(kind.code()))
            .unwrap_or(StoreErrorKind::Internal)
    }
}

/// How a consumer should react to an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Query shape unsupported; recover by falling back.
    Capability,
    /// Access denied; terminal, never retried.
    Permission,
    /// Network or write failure; surfaced as a notice, user may retry.
    Transient,
    /// Rejected before any store call.
    Validation,
}

/// Main error type for synchronization operations.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("store error ({}): {message}", kind.code())]
    Store {
        kind: StoreErrorKind,
        message: String,
    },

    #[error("message text is empty")]
    EmptyMessage,

    #[error("no authenticated user")]
    NotAuthenticated,

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("action targets the current user: {0}")]
    SelfTarget(UserId),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Build a store error.
    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        SyncError::Store {
            kind,
            message: message.into(),
        }
    }

    /// Build a store error from a raw code/message pair.
    pub fn from_remote(code: &str, message: &str) -> Self {
        SyncError::Store {
            kind: StoreErrorKind::detect(code, message),
            message: message.to_string(),
        }
    }

    /// Store status, if this error came from the store.
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            SyncError::Store { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Store { kind, .. } => match kind {
                StoreErrorKind::FailedPrecondition | StoreErrorKind::InvalidArgument => {
                    ErrorClass::Capability
                }
                StoreErrorKind::PermissionDenied => ErrorClass::Permission,
                _ => ErrorClass::Transient,
            },
            SyncError::EmptyMessage
            | SyncError::NotAuthenticated
            | SyncError::NoActiveConversation
            | SyncError::SelfTarget(_)
            | SyncError::MissingField(_)
            | SyncError::InvalidConfig(_) => ErrorClass::Validation,
            SyncError::ConversationNotFound(_)
            | SyncError::SubscriptionDropped(_)
            | SyncError::Serialization(_) => ErrorClass::Transient,
        }
    }

    pub fn is_capability(&self) -> bool {
        self.class() == ErrorClass::Capability
    }

    pub fn is_permission(&self) -> bool {
        self.class() == ErrorClass::Permission
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
