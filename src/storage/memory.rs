use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Document, DocumentStore, FeedEvent, Fields, Query, StoreFeed};
use crate::error::{AppError, AppResult};

struct Watcher {
    query: Query,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct State {
    /// collection -> (id -> fields)
    collections: HashMap<String, HashMap<String, Fields>>,
    watchers: HashMap<u64, Watcher>,
    failing_reads: HashSet<String>,
    offline: bool,
}

impl State {
    fn evaluate(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .collections
            .get(&query.collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, f)| query.matches(f))
                    .map(|(id, f)| Document::new(id.clone(), f.clone()))
                    .collect()
            })
            .unwrap_or_default();
        query.sort(&mut docs);
        docs
    }

    /// Push a fresh snapshot to every watcher of `collection`. Sending happens under the
    /// write lock so each watcher observes mutations in commit order.
    fn notify(&mut self, collection: &str) {
        let mut closed: Vec<u64> = Vec::new();
        let ids: Vec<u64> = self
            .watchers
            .iter()
            .filter(|(_, w)| w.query.collection == collection)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let snapshot = match self.watchers.get(&id) {
                Some(w) => self.evaluate(&w.query),
                None => continue,
            };
            if let Some(w) = self.watchers.get(&id) {
                if w.tx.send(FeedEvent::Snapshot(snapshot)).is_err() {
                    closed.push(id);
                }
            }
        }
        for id in closed {
            self.watchers.remove(&id);
        }
    }

    fn check_online(&self) -> AppResult<()> {
        if self.offline {
            return Err(AppError::unavailable("store_offline", "document store is unreachable"));
        }
        Ok(())
    }

    fn check_readable(&self, collection: &str) -> AppResult<()> {
        self.check_online()?;
        if self.failing_reads.contains(collection) {
            return Err(AppError::unavailable("read_failed".to_string(), format!("reads from '{}' are failing", collection)));
        }
        Ok(())
    }
}

/// In-process document store with push subscriptions.
///
/// Cloning yields another handle onto the same data.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<RwLock<State>>,
    next_watcher: Arc<AtomicU64>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self { Self::default() }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_offline(&self, offline: bool) { self.inner.write().offline = offline; }

    /// Make point reads and one-shot queries against `collection` fail.
    pub fn fail_reads(&self, collection: &str, failing: bool) {
        let mut g = self.inner.write();
        if failing {
            g.failing_reads.insert(collection.to_string());
        } else {
            g.failing_reads.remove(collection);
        }
    }

    /// Break every live query on `collection`: each receives `Failed` and is unregistered.
    pub fn break_subscriptions(&self, collection: &str, message: &str) -> usize {
        let mut g = self.inner.write();
        let ids: Vec<u64> = g
            .watchers
            .iter()
            .filter(|(_, w)| w.query.collection == collection)
            .map(|(id, _)| *id)
            .collect();
        for id in ids.iter() {
            if let Some(w) = g.watchers.remove(id) {
                let _ = w.tx.send(FeedEvent::Failed(AppError::subscription("feed_broken", message)));
            }
        }
        warn!(target: "clinic::store", "broke {} live queries on '{}': {}", ids.len(), collection, message);
        ids.len()
    }

    /// Number of live queries currently registered on `collection`.
    pub fn watcher_count(&self, collection: &str) -> usize {
        self.inner.read().watchers.values().filter(|w| w.query.collection == collection).count()
    }

    /// Number of documents in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.inner.read().collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool { self.len(collection) == 0 }

    fn unregister(state: &Weak<RwLock<State>>, id: u64) {
        if let Some(state) = state.upgrade() {
            if state.write().watchers.remove(&id).is_some() {
                debug!(target: "clinic::store", "watcher {} unregistered", id);
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> AppResult<Document> {
        let g = self.inner.read();
        g.check_readable(collection)?;
        g.collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|f| Document::new(id, f.clone()))
            .ok_or_else(|| AppError::not_found("record_not_found".to_string(), format!("{}/{} does not exist", collection, id)))
    }

    async fn list(&self, query: &Query) -> AppResult<Vec<Document>> {
        let g = self.inner.read();
        g.check_readable(&query.collection)?;
        Ok(g.evaluate(query))
    }

    async fn add(&self, collection: &str, fields: Fields) -> AppResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        let mut g = self.inner.write();
        g.check_online()?;
        g.collections.entry(collection.to_string()).or_default().insert(id.clone(), fields);
        g.notify(collection);
        debug!(target: "clinic::store", "add {}/{}", collection, id);
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> AppResult<()> {
        let mut g = self.inner.write();
        g.check_online()?;
        g.collections.entry(collection.to_string()).or_default().insert(id.to_string(), fields);
        g.notify(collection);
        debug!(target: "clinic::store", "set {}/{}", collection, id);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, partial: Fields) -> AppResult<()> {
        let mut g = self.inner.write();
        g.check_online()?;
        let Some(existing) = g.collections.get_mut(collection).and_then(|c| c.get_mut(id)) else {
            return Err(AppError::not_found("record_not_found".to_string(), format!("{}/{} does not exist", collection, id)));
        };
        for (k, v) in partial {
            existing.insert(k, v);
        }
        g.notify(collection);
        debug!(target: "clinic::store", "update {}/{}", collection, id);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> AppResult<()> {
        let mut g = self.inner.write();
        g.check_online()?;
        let removed = g.collections.get_mut(collection).and_then(|c| c.remove(id)).is_some();
        if removed {
            g.notify(collection);
        }
        debug!(target: "clinic::store", "delete {}/{} removed={}", collection, id, removed);
        Ok(())
    }

    fn subscribe(&self, query: &Query) -> AppResult<StoreFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        {
            let mut g = self.inner.write();
            g.check_online()?;
            let initial = g.evaluate(query);
            // receiver is held locally, so the initial send cannot fail
            let _ = tx.send(FeedEvent::Snapshot(initial));
            g.watchers.insert(id, Watcher { query: query.clone(), tx });
        }
        debug!(target: "clinic::store", "watcher {} registered on '{}'", id, query.collection);
        let weak = Arc::downgrade(&self.inner);
        Ok(StoreFeed::new(rx, move || Self::unregister(&weak, id)))
    }
}
