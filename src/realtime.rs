//! Real-time collection synchronizer.
//!
//! `RealtimeCollection<T>` turns store subscriptions into typed, ordered snapshots. Views that
//! ask for the same `SubscriptionKey` through the same `SubscriptionHub` share one upstream
//! store feed; each view still owns its own `SubscriptionHandle`, and disposing it detaches
//! only that view. The upstream is closed when its last view leaves.
//!
//! Delivery guarantees:
//! - events of one upstream reach each view in store emission order, none are coalesced;
//! - once `dispose` returns, the view's callback never runs again, even for an event that
//!   was already in flight (liveness is re-checked under the per-view delivery lock);
//! - a broken feed surfaces as `CollectionEvent::Failed` and ends that subscription; nothing
//!   is retried automatically.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::storage::{Document, FeedEvent, SharedDocumentStore, StoreFeed, SubscriptionKey};

/// A record together with its stable document id.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub id: String,
    pub record: T,
}

/// Ordered materialization of a live query at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    key: SubscriptionKey,
    items: Vec<Stored<T>>,
}

impl<T> Snapshot<T> {
    pub fn key(&self) -> &SubscriptionKey { &self.key }
    pub fn items(&self) -> &[Stored<T>] { &self.items }
    pub fn into_items(self) -> Vec<Stored<T>> { self.items }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Stored<T>> { self.items.iter() }
    pub fn ids(&self) -> Vec<&str> { self.items.iter().map(|s| s.id.as_str()).collect() }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent<T> {
    Snapshot(Snapshot<T>),
    /// The subscription is over; the view must stop presenting its data as live.
    Failed(AppError),
}

fn decode_snapshot<T: DeserializeOwned>(key: &SubscriptionKey, docs: &[Document]) -> AppResult<Snapshot<T>> {
    let mut ordered: Vec<Document> = docs.to_vec();
    key.sort(&mut ordered);
    let mut items = Vec::with_capacity(ordered.len());
    for doc in ordered.iter() {
        let record = doc.decode::<T>().map_err(|e| AppError::subscription("decode_failed", e.message()))?;
        items.push(Stored { id: doc.id.clone(), record });
    }
    Ok(Snapshot { key: key.clone(), items })
}

type Callback<T> = Box<dyn FnMut(CollectionEvent<T>) + Send>;

/// Untyped view of a listener, so one upstream can fan out to views of different record types.
trait Downstream: Send + Sync {
    fn id(&self) -> u64;
    fn is_alive(&self) -> bool;
    fn deliver(&self, key: &SubscriptionKey, seq: u64, event: &FeedEvent);
    fn close(&self);
}

struct Listener<T> {
    id: u64,
    alive: AtomicBool,
    /// Highest upstream sequence number handed to the callback.
    delivered: AtomicU64,
    slot: ReentrantMutex<RefCell<Option<Callback<T>>>>,
}

impl<T> Listener<T> {
    fn new(id: u64, callback: Callback<T>) -> Self {
        Self { id, alive: AtomicBool::new(true), delivered: AtomicU64::new(0), slot: ReentrantMutex::new(RefCell::new(Some(callback))) }
    }
}

impl<T: DeserializeOwned + Send + 'static> Downstream for Listener<T> {
    fn id(&self) -> u64 { self.id }

    fn is_alive(&self) -> bool { self.alive.load(Ordering::SeqCst) }

    fn deliver(&self, key: &SubscriptionKey, seq: u64, event: &FeedEvent) {
        let guard = self.slot.lock();
        if !self.is_alive() || seq <= self.delivered.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut slot) = guard.try_borrow_mut() else {
            // re-entered from inside this listener's own callback
            return;
        };
        self.delivered.store(seq, Ordering::SeqCst);
        let converted = match event {
            FeedEvent::Snapshot(docs) => match decode_snapshot::<T>(key, docs) {
                Ok(snapshot) => CollectionEvent::Snapshot(snapshot),
                Err(e) => CollectionEvent::Failed(e),
            },
            FeedEvent::Failed(e) => CollectionEvent::Failed(e.clone()),
        };
        let terminal = matches!(converted, CollectionEvent::Failed(_));
        if terminal {
            self.alive.store(false, Ordering::SeqCst);
        }
        if let Some(cb) = slot.as_mut() {
            cb(converted);
        }
        if terminal || !self.is_alive() {
            slot.take();
        }
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Waits for an in-flight delivery on another thread to finish.
        let guard = self.slot.lock();
        if let Ok(mut slot) = guard.try_borrow_mut() {
            slot.take();
        };
    }
}

struct Upstream {
    uid: u64,
    listeners: Vec<Arc<dyn Downstream>>,
    /// Latest snapshot and its sequence number, replayed to views that join later.
    last: Option<(u64, Vec<Document>)>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct HubInner {
    upstreams: Mutex<HashMap<SubscriptionKey, Upstream>>,
    next_uid: AtomicU64,
    next_listener: AtomicU64,
}

/// Registry of shared upstream feeds, one per `SubscriptionKey`.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new() -> Self { Self::default() }

    /// Number of distinct live queries currently open against the store.
    pub fn upstream_count(&self) -> usize { self.inner.upstreams.lock().len() }

    /// Number of live views attached to `key`.
    pub fn view_count(&self, key: &SubscriptionKey) -> usize {
        self.inner.upstreams.lock().get(key).map(|u| u.listeners.iter().filter(|l| l.is_alive()).count()).unwrap_or(0)
    }

    fn detach(inner: &HubInner, key: &SubscriptionKey, listener_id: u64) {
        let mut map = inner.upstreams.lock();
        let Some(up) = map.get_mut(key) else { return };
        up.listeners.retain(|l| l.id() != listener_id && l.is_alive());
        if up.listeners.is_empty() {
            if let Some(up) = map.remove(key) {
                up.pump.abort();
                debug!(target: "clinic::realtime", "closed upstream '{}' uid={}", key.collection, up.uid);
            }
        }
    }

    async fn pump(hub: Weak<HubInner>, key: SubscriptionKey, uid: u64, mut feed: StoreFeed) {
        let mut seq: u64 = 0;
        loop {
            let event = match feed.next().await {
                Some(ev) => ev,
                None => FeedEvent::Failed(AppError::subscription("feed_closed", "the store closed the live query")),
            };
            seq += 1;
            let Some(inner) = hub.upgrade() else { break };
            let terminal = matches!(event, FeedEvent::Failed(_));
            let listeners = {
                let mut map = inner.upstreams.lock();
                let Some(up) = map.get_mut(&key).filter(|u| u.uid == uid) else { break };
                if let FeedEvent::Snapshot(docs) = &event {
                    up.last = Some((seq, docs.clone()));
                }
                let listeners = up.listeners.clone();
                if terminal {
                    map.remove(&key);
                }
                listeners
            };
            if let FeedEvent::Failed(e) = &event {
                warn!(target: "clinic::realtime", "live query on '{}' failed: {}", key.collection, e);
            }
            for l in listeners.iter() {
                l.deliver(&key, seq, &event);
            }
            if terminal {
                break;
            }
        }
        feed.close();
    }
}

/// View-owned subscription. Disposing is idempotent and also happens on drop, so every exit
/// path of the owning view releases it.
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    listener: Arc<dyn Downstream>,
    hub: Weak<HubInner>,
    disposed: AtomicBool,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey { &self.key }

    /// Still receiving events: not disposed and not ended by a failure.
    pub fn is_active(&self) -> bool { !self.disposed.load(Ordering::SeqCst) && self.listener.is_alive() }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.close();
        if let Some(inner) = self.hub.upgrade() {
            SubscriptionHub::detach(&inner, &self.key, self.listener.id());
        }
        debug!(target: "clinic::realtime", "disposed view {} on '{}'", self.listener.id(), self.key.collection);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) { self.dispose(); }
}

/// Typed access to live and one-shot reads of documents shaped like `T`.
pub struct RealtimeCollection<T> {
    store: SharedDocumentStore,
    hub: SubscriptionHub,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for RealtimeCollection<T> {
    fn clone(&self) -> Self { Self { store: Arc::clone(&self.store), hub: self.hub.clone(), _record: PhantomData } }
}

impl<T: DeserializeOwned + Send + 'static> RealtimeCollection<T> {
    /// Collection with its own private hub.
    pub fn new(store: SharedDocumentStore) -> Self { Self::with_hub(store, SubscriptionHub::new()) }

    /// Collection sharing upstream feeds through `hub`.
    pub fn with_hub(store: SharedDocumentStore, hub: SubscriptionHub) -> Self { Self { store, hub, _record: PhantomData } }

    pub fn hub(&self) -> &SubscriptionHub { &self.hub }

    /// Open (or join) the live query for `key`. `callback` receives a full ordered snapshot on
    /// every change, or a single `Failed` if the query breaks. Must run inside a Tokio runtime.
    pub fn subscribe<F>(&self, key: SubscriptionKey, callback: F) -> AppResult<SubscriptionHandle>
    where
        F: FnMut(CollectionEvent<T>) + Send + 'static,
    {
        let inner = &self.hub.inner;
        let listener_id = inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener: Arc<Listener<T>> = Arc::new(Listener::new(listener_id, Box::new(callback)));
        let dyn_listener: Arc<dyn Downstream> = listener.clone();

        let replay = {
            let mut map = inner.upstreams.lock();
            match map.get_mut(&key) {
                Some(up) => {
                    up.listeners.push(Arc::clone(&dyn_listener));
                    debug!(target: "clinic::realtime", "view {} joined upstream '{}' uid={}", listener_id, key.collection, up.uid);
                    up.last.clone()
                }
                None => {
                    let feed = self.store.subscribe(&key).map_err(|e| {
                        AppError::subscription("subscribe_failed".to_string(), format!("could not open live query on '{}': {}", key.collection, e.message()))
                    })?;
                    let uid = inner.next_uid.fetch_add(1, Ordering::Relaxed);
                    // The pump blocks on the hub lock until this upstream is registered.
                    let pump = tokio::spawn(SubscriptionHub::pump(Arc::downgrade(inner), key.clone(), uid, feed));
                    map.insert(key.clone(), Upstream { uid, listeners: vec![Arc::clone(&dyn_listener)], last: None, pump });
                    info!(target: "clinic::realtime", "opened upstream '{}' uid={} view={}", key.collection, uid, listener_id);
                    None
                }
            }
        };
        if let Some((seq, docs)) = replay {
            listener.deliver(&key, seq, &FeedEvent::Snapshot(docs));
        }

        Ok(SubscriptionHandle { key, listener: dyn_listener, hub: Arc::downgrade(inner), disposed: AtomicBool::new(false) })
    }

    /// Channel-based variant of `subscribe`.
    pub fn watch(&self, key: SubscriptionKey) -> AppResult<(SubscriptionHandle, mpsc::UnboundedReceiver<CollectionEvent<T>>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(key, move |ev| {
            let _ = tx.send(ev);
        })?;
        Ok((handle, rx))
    }

    /// Release a subscription. Same as `handle.dispose()`.
    pub fn dispose(&self, handle: &SubscriptionHandle) { handle.dispose(); }

    /// Single point read. A missing record is `NotFound`, never an empty result.
    pub async fn read_once(&self, collection: &str, id: &str) -> AppResult<Stored<T>> {
        let doc = self.store.get(collection, id).await?;
        let record = doc.decode::<T>()?;
        Ok(Stored { id: doc.id, record })
    }

    /// One-shot ordered query.
    pub async fn fetch(&self, key: &SubscriptionKey) -> AppResult<Snapshot<T>> {
        let docs = self.store.list(key).await?;
        decode_snapshot(key, &docs).map_err(|e| AppError::user("decode_failed", e.message()))
    }
}

#[cfg(test)]
#[path = "realtime_tests.rs"]
mod realtime_tests;
