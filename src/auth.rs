//! Boundary to the auth provider: who is signed in, and when that changes.

use crate::config::SyncConfig;
use crate::remote::{Document, DocumentPath, RemoteStore};
use crate::types::UserId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The signed-in user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: None,
            email: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Name stamped on outgoing messages: display name, then email.
    pub fn sender_name(&self) -> String {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.email.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

/// Pick the name to show for a user.
///
/// Profile fields win (`name`, `displayName`, `fullName`), then the auth
/// display name, then email, then "User".
pub fn resolve_display_name(profile: Option<&Document>, identity: &Identity) -> String {
    profile
        .and_then(|doc| {
            ["name", "displayName", "fullName"]
                .into_iter()
                .find_map(|field| doc.get_str(field))
        })
        .or(identity.display_name.as_deref().filter(|n| !n.is_empty()))
        .or(identity.email.as_deref().filter(|e| !e.is_empty()))
        .unwrap_or("User")
        .to_string()
}

/// Display name for `identity`, looked up in its profile document under
/// `users_collection`. An unreadable profile falls back to the auth fields.
pub fn load_display_name(store: &dyn RemoteStore, config: &SyncConfig, identity: &Identity) -> String {
    let path = DocumentPath::new(config.users_collection.clone(), identity.user_id.as_str());
    let profile = store.get_document(&path).unwrap_or_else(|err| {
        tracing::warn!(user = %identity.user_id, error = %err, "profile lookup failed");
        None
    });
    resolve_display_name(profile.as_ref(), identity)
}

/// Auth change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Identity),
    SignedOut,
}

#[derive(Default)]
struct AuthInner {
    current: RwLock<Option<Identity>>,
    watchers: Mutex<Vec<Sender<AuthEvent>>>,
}

/// Current sign-in state plus a live change signal.
///
/// Cloning shares the same state.
#[derive(Clone, Default)]
pub struct AuthState {
    inner: Arc<AuthInner>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(identity: Identity) -> Self {
        let state = Self::new();
        *state.inner.current.write() = Some(identity);
        state
    }

    pub fn current(&self) -> Option<Identity> {
        self.inner.current.read().clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.inner.current.read().as_ref().map(|i| i.user_id.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.current.read().is_some()
    }

    pub fn sign_in(&self, identity: Identity) {
        *self.inner.current.write() = Some(identity.clone());
        self.notify(AuthEvent::SignedIn(identity));
    }

    pub fn sign_out(&self) {
        let was_signed_in = self.inner.current.write().take().is_some();
        if was_signed_in {
            self.notify(AuthEvent::SignedOut);
        }
    }

    /// Subscribe to changes. The current state is delivered first.
    pub fn watch(&self) -> Receiver<AuthEvent> {
        let (sender, receiver) = unbounded();
        let initial = match self.current() {
            Some(identity) => AuthEvent::SignedIn(identity),
            None => AuthEvent::SignedOut,
        };
        let _ = sender.send(initial);
        self.inner.watchers.lock().push(sender);
        receiver
    }

    fn notify(&self, event: AuthEvent) {
        // Forget watchers whose receiver is gone
        self.inner
            .watchers
            .lock()
            .retain(|watcher| watcher.send(event.clone()).is_ok());
    }
}
