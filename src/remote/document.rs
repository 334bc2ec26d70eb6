//! Documents and field writes.

use crate::error::{Result, SyncError};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Location of a single document.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPath {
    /// Slash-separated collection path, e.g. `conversations/c1/messages`.
    pub collection: String,
    pub id: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Debug for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentPath({}/{})", self.collection, self.id)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as read from the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String field; empty strings count as absent.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.fields.get(field).and_then(Value::as_u64)
    }

    /// Server-assigned timestamp; None while not yet stamped.
    pub fn get_timestamp(&self, field: &str) -> Option<Timestamp> {
        self.fields.get(field).and_then(Value::as_i64).map(Timestamp)
    }
}

/// A single field write.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Literal value.
    Value(Value),
    /// Resolved by the store to the commit time.
    ServerTimestamp,
    /// Atomic numeric delta applied by the store; missing fields count as 0.
    Increment(i64),
}

/// Field writes for set/update operations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fields(pub BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), FieldValue::Value(value.into()));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldValue::ServerTimestamp);
        self
    }

    pub fn increment(mut self, field: impl Into<String>, delta: i64) -> Self {
        self.0.insert(field.into(), FieldValue::Increment(delta));
        self
    }

    /// Build from a serializable struct (all literal values).
    pub fn from_serializable(value: &impl Serialize) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(
                map.into_iter()
                    .map(|(k, v)| (k, FieldValue::Value(v)))
                    .collect(),
            )),
            other => Err(SyncError::Serialization(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply these writes onto `target`, resolving server values with `now`.
    pub fn apply_to(&self, target: &mut Map<String, Value>, now: Timestamp) {
        for (field, write) in &self.0 {
            let value = match write {
                FieldValue::Value(v) => v.clone(),
                FieldValue::ServerTimestamp => Value::from(now.0),
                FieldValue::Increment(delta) => {
                    let current = target.get(field).and_then(Value::as_i64).unwrap_or(0);
                    Value::from(current + delta)
                }
            };
            target.insert(field.clone(), value);
        }
    }
}
