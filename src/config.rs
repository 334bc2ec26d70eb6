//! Configuration for the synchronization layer.

use crate::error::{Result, SyncError};
use serde::Deserialize;

/// How conversation document identifiers are chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationIdStrategy {
    /// Id derived from the sorted member pair; creation is create-if-absent,
    /// so both ends racing land on the same document.
    #[default]
    PairDerived,
    /// Store-assigned random id. Two peers creating at the same instant can
    /// end up with two documents for one pair.
    Random,
}

/// Synchronization configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Collection holding conversation documents.
    pub conversations_collection: String,

    /// Sub-collection (under each conversation) holding messages.
    pub messages_collection: String,

    /// Collection holding job applications.
    pub applications_collection: String,

    /// Collection holding user profiles.
    pub users_collection: String,

    /// Prefix of the per-participant unread counter field.
    /// Default: "unread_"
    pub unread_field_prefix: String,

    /// Max buffered snapshots per live query; older ones are discarded
    /// when a consumer falls behind.
    /// Default: 1000
    pub subscription_buffer: usize,

    pub conversation_ids: ConversationIdStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversations_collection: "conversations".to_string(),
            messages_collection: "messages".to_string(),
            applications_collection: "applications".to_string(),
            users_collection: "users".to_string(),
            unread_field_prefix: "unread_".to_string(),
            subscription_buffer: 1000,
            conversation_ids: ConversationIdStrategy::default(),
        }
    }
}

impl SyncConfig {
    /// Parse a JSON configuration; omitted fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let names = [
            ("conversations_collection", &self.conversations_collection),
            ("messages_collection", &self.messages_collection),
            ("applications_collection", &self.applications_collection),
            ("users_collection", &self.users_collection),
        ];
        for (field, name) in names {
            if name.is_empty() || name.contains('/') {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be a single non-empty path segment, got {:?}",
                    field, name
                )));
            }
        }
        if self.unread_field_prefix.is_empty() {
            return Err(SyncError::InvalidConfig(
                "unread_field_prefix must not be empty".into(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "subscription_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Field holding `user`'s unread counter on a conversation document.
    pub fn unread_field(&self, user: &str) -> String {
        format!("{}{}", self.unread_field_prefix, user)
    }

    /// Collection path of a conversation's messages.
    pub fn messages_path(&self, conversation_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.conversations_collection, conversation_id, self.messages_collection
        )
    }
}
