//! Document storage consumed by the agent.
//!
//! The agent only needs four primitives from its database: insert, a filtered
//! query with sort and limit, an update, and a change feed of inserts and
//! updates. [`DocumentStore`] captures exactly those; [`MemoryStore`] is the
//! in-process implementation used by the binary and the tests.

pub mod memory;
pub mod pose;
pub mod records;

pub use memory::MemoryStore;
pub use pose::{PoseError, PoseStore};
pub use records::RecordWriter;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Identifier assigned to every stored document (`_id`).
pub type DocumentId = String;

/// Kind of mutation reported on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
}

/// One entry of the change feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub collection: String,
    /// Document as it is after the mutation
    pub full_document: Value,
}

/// Storage failures (the persistence errors of the agent).
#[derive(Debug)]
pub enum StoreError {
    /// Only JSON objects can be stored
    InvalidDocument(String),
    Io(String),
    Serialization(String),
    /// Backend is not reachable or its state is unusable
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidDocument(msg) => write!(f, "Invalid document: {msg}"),
            StoreError::Io(msg) => write!(f, "Store IO error: {msg}"),
            StoreError::Serialization(msg) => write!(f, "Store serialization error: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Minimal document database interface.
pub trait DocumentStore: Send + Sync {
    /// Insert one document, returning its id.
    fn insert(&self, collection: &str, document: Value) -> Result<DocumentId, StoreError>;

    /// Insert several documents at once.
    fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<DocumentId>, StoreError> {
        documents
            .into_iter()
            .map(|doc| self.insert(collection, doc))
            .collect()
    }

    /// Merge `fields` into the document with the given id. Returns false when
    /// no such document exists.
    fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<bool, StoreError>;

    /// Run a filtered query.
    fn find(&self, collection: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Subscribe to inserts and updates across all collections.
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn DocumentStore>;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One predicate of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    NotNull(String),
    Gte(String, f64),
    Lte(String, f64),
}

impl Filter {
    fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Eq(field, expected) => doc.get(field) == Some(expected),
            Filter::NotNull(field) => doc.get(field).is_some_and(|v| !v.is_null()),
            Filter::Gte(field, bound) => doc
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|v| v >= *bound),
            Filter::Lte(field, bound) => doc
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|v| v <= *bound),
        }
    }
}

/// Conjunction of filters, with optional sort and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn not_null(mut self, field: &str) -> Self {
        self.filters.push(Filter::NotNull(field.to_string()));
        self
    }

    pub fn gte(mut self, field: &str, bound: f64) -> Self {
        self.filters.push(Filter::Gte(field.to_string(), bound));
        self
    }

    pub fn lte(mut self, field: &str, bound: f64) -> Self {
        self.filters.push(Filter::Lte(field.to_string(), bound));
        self
    }

    pub fn sort(mut self, field: &str, order: SortOrder) -> Self {
        self.sort = Some((field.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, sort and truncate `docs` in memory.
    pub fn apply<'a>(&self, docs: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
        let mut matched: Vec<Value> = docs.into_iter().filter(|d| self.matches(d)).cloned().collect();

        if let Some((field, order)) = &self.sort {
            matched.sort_by(|a, b| {
                let ordering = compare_field(a.get(field), b.get(field));
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Order by numeric value, then string; missing values sort first.
fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
