//!
//! clinic_portal storage module
//! ----------------------------
//! The portal never talks to a concrete database. It consumes a `DocumentStore` capability:
//! named collections of JSON documents with point reads, ordered queries, add/set/update/delete
//! and push-based subscriptions. A subscription is a `StoreFeed`, an unbounded channel of full
//! ordered snapshots plus a cancel guard that unregisters the watcher when the feed is closed
//! or dropped.
//!
//! `MemoryDocumentStore` is the in-process backend used by the demo binary and the tests.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};

pub mod memory;

pub use memory::MemoryDocumentStore;

/// Field map of a single document, without its id.
pub type Fields = serde_json::Map<String, Value>;

/// A stored document: stable id plus its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self { Self { id: id.into(), fields } }

    pub fn get(&self, field: &str) -> Option<&Value> { self.fields.get(field) }

    /// Decode the fields into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            AppError::user("decode_failed".to_string(), format!("document '{}' does not match the expected shape: {}", self.id, e))
        })
    }
}

/// Convert a serializable record into a field map. Non-object values are rejected.
pub fn to_fields<T: Serialize>(record: &T) -> AppResult<Fields> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(AppError::user("not_an_object".to_string(), format!("expected a JSON object, got {}", other))),
    }
}

/// Row predicate of a query. Only equality is needed by the portal's views.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq { field: field.into(), value: value.into() }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::Eq { field, value } => fields.get(field) == Some(value),
        }
    }
}

impl Eq for Filter {}

impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Filter::Eq { field, value } => {
                "eq".hash(state);
                field.hash(state);
                // serde_json::Value is not Hash; canonical text identifies the operand
                value.to_string().hash(state);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderSpec {
    pub field: String,
    pub direction: Direction,
}

impl OrderSpec {
    pub fn asc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: Direction::Asc } }
    pub fn desc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: Direction::Desc } }

    /// Total order over documents: the order field in the requested direction, then id ascending.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let primary = compare_values(a.get(&self.field), b.get(&self.field));
        let primary = match self.direction {
            Direction::Asc => primary,
            Direction::Desc => primary.reverse(),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Compare two optional JSON values. Missing and null sort first; numbers compare numerically,
/// strings lexically; mixed types order by type rank.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x @ Value::Array(_)), Some(y @ Value::Array(_)))
        | (Some(x @ Value::Object(_)), Some(y @ Value::Object(_))) => x.to_string().cmp(&y.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// A query over one collection: the subscribe-capable cursor handed to `DocumentStore`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub collection: String,
    pub filter: Option<Filter>,
    pub order: OrderSpec,
}

/// Identity of a live query: (collection, filter, order).
pub type SubscriptionKey = Query;

impl Query {
    pub fn new(collection: impl Into<String>, order: OrderSpec) -> Self {
        Self { collection: collection.into(), filter: None, order }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filter.as_ref().map(|f| f.matches(fields)).unwrap_or(true)
    }

    /// Sort documents into this query's order.
    pub fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| self.order.compare(a, b));
    }
}

/// One delivery on a live query.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Full ordered result set after a change.
    Snapshot(Vec<Document>),
    /// The live query broke. No further events follow.
    Failed(AppError),
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Receiving side of a store subscription.
pub struct StoreFeed {
    events: mpsc::UnboundedReceiver<FeedEvent>,
    cancel: Option<CancelFn>,
}

impl StoreFeed {
    pub fn new(events: mpsc::UnboundedReceiver<FeedEvent>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { events, cancel: Some(Box::new(cancel)) }
    }

    /// Next event in emission order; `None` once the store closed the feed.
    pub async fn next(&mut self) -> Option<FeedEvent> { self.events.recv().await }

    /// Unregister from the store. Idempotent.
    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.events.close();
    }
}

impl Drop for StoreFeed {
    fn drop(&mut self) { self.close(); }
}

/// Capability interface of the remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read. A missing document is `AppError::NotFound`.
    async fn get(&self, collection: &str, id: &str) -> AppResult<Document>;
    /// One-shot query.
    async fn list(&self, query: &Query) -> AppResult<Vec<Document>>;
    /// Insert with a store-assigned id.
    async fn add(&self, collection: &str, fields: Fields) -> AppResult<String>;
    /// Create or replace a document under a caller-chosen id.
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> AppResult<()>;
    /// Merge partial fields into an existing document.
    async fn update(&self, collection: &str, id: &str, partial: Fields) -> AppResult<()>;
    async fn delete(&self, collection: &str, id: &str) -> AppResult<()>;
    /// Open a live query. The first event is the current result set.
    fn subscribe(&self, query: &Query) -> AppResult<StoreFeed>;
}

pub type SharedDocumentStore = Arc<dyn DocumentStore>;
