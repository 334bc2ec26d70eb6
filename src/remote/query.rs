//! Query description and evaluation.
//!
//! The ordering comparator defined here is the single source of truth for
//! "ordered by field": the in-process store uses it to answer ordered queries
//! and the feed subscriber uses it for its client-side fallback, so both
//! produce identical sequences.

use super::document::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// A single-field predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// `field == value`
    Equal { field: String, value: Value },
    /// `field` is an array containing `value`.
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Equal {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::ArrayContains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Equal { field, .. } | Filter::ArrayContains { field, .. } => field,
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Equal { field, value } => doc.get(field) == Some(value),
            Filter::ArrayContains { field, value } => doc
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

/// Ordering clause.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A query against one collection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Whether answering this query on the server needs a composite index.
    pub fn needs_composite_index(&self) -> bool {
        match &self.order_by {
            Some(order) => self.filters.iter().any(|f| f.field() != order.field),
            None => false,
        }
    }

    /// Evaluate against an unordered set of candidate documents.
    pub fn evaluate<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs
            .into_iter()
            .filter(|d| self.matches(d))
            .cloned()
            .collect();
        match &self.order_by {
            Some(order) => sort_documents(&mut matched, &order.field, order.direction),
            None => matched.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Rank of a value's type. Missing and null sort lowest.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Compare two field values.
///
/// Missing or null (an unstamped server timestamp) is the lowest value.
/// Across types: booleans, then numbers, then strings.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::MIN);
                let y = y.as_f64().unwrap_or(f64::MIN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Sort documents by `field`; ties break by id ascending in both directions.
pub fn sort_documents(docs: &mut [Document], field: &str, direction: Direction) {
    docs.sort_by(|a, b| {
        let ord = compare_values(a.get(field), b.get(field));
        let ord = match direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        ord.then_with(|| a.id.cmp(&b.id))
    });
}
