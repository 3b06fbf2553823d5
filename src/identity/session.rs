use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::authorizer::Role;
use super::cache::{CachedSession, SharedSessionCache};
use super::principal::Identity;
use super::provider::SharedIdentityProvider;
use crate::error::{AppError, AppResult};
use crate::storage::SharedDocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No identity.
    Unauthenticated,
    /// Identity known, role lookup in flight.
    Resolving,
    /// Identity known and role lookup finished. `role` may still be absent right after signup.
    Ready,
    /// Role lookup failed.
    Error,
}

/// Client-local view of who is signed in and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Option<Identity>,
    pub role: Option<Role>,
    pub status: SessionStatus,
    /// Restored from the session cache and not yet confirmed by the identity provider.
    pub provisional: bool,
    /// Publish sequence number; strictly increasing per manager.
    pub revision: u64,
}

impl Session {
    pub fn unauthenticated(revision: u64) -> Self {
        Self { identity: None, role: None, status: SessionStatus::Unauthenticated, provisional: false, revision }
    }

    pub fn is_authenticated(&self) -> bool { self.identity.is_some() && self.status != SessionStatus::Unauthenticated }
    pub fn is_ready(&self) -> bool { self.status == SessionStatus::Ready }
    /// Ready and confirmed by the identity provider.
    pub fn is_verified(&self) -> bool { self.is_ready() && !self.provisional }
    /// Signed up but the directory entry has not propagated yet.
    pub fn role_pending(&self) -> bool { self.is_ready() && self.identity.is_some() && self.role.is_none() }
    pub fn identity_id(&self) -> Option<&str> { self.identity.as_ref().map(|i| i.id.as_str()) }
}

pub type SessionListener = Arc<dyn Fn(&Session) + Send + Sync>;

struct State {
    session: Session,
    /// Bumped on every identity change, sign-out and retry. Lookups carrying an older
    /// generation are discarded.
    generation: u64,
    last_error: Option<AppError>,
    started: bool,
    /// Identifies the provider feed currently attached. Events from an older feed are dropped.
    feed_epoch: u64,
}

/// Single source of truth for the current session.
///
/// Shared as `Arc<SessionManager>` and handed to consumers explicitly. Every transition is
/// delivered synchronously to all listeners, in publish order. `start` and any call that
/// triggers a role lookup must run inside a Tokio runtime.
pub struct SessionManager {
    provider: SharedIdentityProvider,
    store: SharedDocumentStore,
    cache: SharedSessionCache,
    users_collection: String,
    state: RwLock<State>,
    listeners: RwLock<Vec<(u64, SessionListener)>>,
    next_listener: AtomicU64,
    publish: ReentrantMutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        provider: SharedIdentityProvider,
        store: SharedDocumentStore,
        cache: SharedSessionCache,
        users_collection: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            store,
            cache,
            users_collection: users_collection.into(),
            state: RwLock::new(State { session: Session::unauthenticated(0), generation: 0, last_error: None, started: false, feed_epoch: 0 }),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            publish: ReentrantMutex::new(()),
            pump: Mutex::new(None),
        })
    }

    pub fn current(&self) -> Session { self.state.read().session.clone() }

    /// Error from the most recent failed role lookup, cleared by the next successful one.
    pub fn last_error(&self) -> Option<AppError> { self.state.read().last_error.clone() }

    pub fn provider(&self) -> &SharedIdentityProvider { &self.provider }

    /// Restore the cached session (if any) as a provisional `Ready` session, then begin
    /// listening to the identity provider. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        {
            let _g = self.publish.lock();
            {
                let mut st = self.state.write();
                if st.started {
                    return;
                }
                st.started = true;
            }
            if let Some(cached) = self.cache.load() {
                match cached.role.parse::<Role>() {
                    Ok(role) => {
                        info!(target: "clinic::session", "restoring cached session id={} role={}", cached.identity.id, role);
                        self.publish_locked(Some(cached.identity), Some(role), SessionStatus::Ready, true);
                    }
                    Err(_) => {
                        warn!(target: "clinic::session", "discarding cached session with unknown role '{}'", cached.role);
                        self.clear_cache();
                    }
                }
            }
        }

        self.attach_feed(false);
    }

    /// Subscribe to the provider and pump its events into the state machine, replacing any
    /// previous feed. With `skip_replay` the feed's leading current-state event is ignored.
    fn attach_feed(self: &Arc<Self>, skip_replay: bool) {
        let epoch = {
            let mut st = self.state.write();
            st.feed_epoch += 1;
            st.feed_epoch
        };
        let mut feed = self.provider.on_change();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut skip = skip_replay;
            while let Some(event) = feed.next().await {
                if std::mem::take(&mut skip) {
                    debug!(target: "clinic::session", "ignoring replayed identity after sign-out epoch={}", epoch);
                    continue;
                }
                let Some(this) = weak.upgrade() else { break };
                this.apply_feed_event(epoch, event);
            }
            debug!(target: "clinic::session", "identity feed closed epoch={}", epoch);
        });
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    fn apply_feed_event(self: &Arc<Self>, epoch: u64, identity: Option<Identity>) {
        let _g = self.publish.lock();
        let current = self.state.read().feed_epoch;
        if current != epoch {
            debug!(target: "clinic::session", "dropping identity event from superseded feed epoch={} current={}", epoch, current);
            return;
        }
        self.on_identity_event(identity);
    }

    /// Apply one identity-provider event. A new event supersedes any lookup still in flight.
    pub fn on_identity_event(self: &Arc<Self>, identity: Option<Identity>) {
        let _g = self.publish.lock();
        match identity {
            None => {
                self.bump_generation();
                self.clear_cache();
                if self.state.read().session.status != SessionStatus::Unauthenticated {
                    self.publish_locked(None, None, SessionStatus::Unauthenticated, false);
                }
            }
            Some(identity) => {
                let generation = self.bump_generation();
                self.publish_locked(Some(identity.clone()), None, SessionStatus::Resolving, false);
                self.spawn_lookup(identity, generation);
            }
        }
    }

    /// Re-run the role lookup for the current identity, e.g. after `Error` or while the
    /// directory entry of a fresh signup is still missing. Returns false when signed out.
    pub fn retry(self: &Arc<Self>) -> bool {
        let _g = self.publish.lock();
        let Some(identity) = self.state.read().session.identity.clone() else { return false };
        let generation = self.bump_generation();
        self.publish_locked(Some(identity.clone()), None, SessionStatus::Resolving, false);
        self.spawn_lookup(identity, generation);
        true
    }

    /// Sign out. Local state is reset before the provider is contacted, so logout never waits
    /// on the network; a provider failure is returned after the reset.
    ///
    /// Identity events the provider emitted before this call are discarded: the feed is
    /// replaced and its replayed current state skipped. Only changes the provider reports
    /// afterwards (a new sign-in, or its own sign-out) move the session again.
    pub async fn sign_out(self: &Arc<Self>) -> AppResult<()> {
        {
            let _g = self.publish.lock();
            self.bump_generation();
            self.clear_cache();
            if self.state.read().session.status != SessionStatus::Unauthenticated {
                self.publish_locked(None, None, SessionStatus::Unauthenticated, false);
            }
            if self.state.read().started {
                self.attach_feed(true);
            }
        }
        if let Err(e) = self.provider.sign_out().await {
            warn!(target: "clinic::session", "remote sign-out failed after local reset: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Register a listener. It is called immediately with the current session, then on every
    /// transition until the returned subscription is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> SessionSubscription
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let _g = self.publish.lock();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener: SessionListener = Arc::new(listener);
        listener(&self.current());
        self.listeners.write().push((id, listener));
        SessionSubscription { manager: Arc::downgrade(self), id: Some(id) }
    }

    /// Channel-based variant of `subscribe`.
    pub fn watch(self: &Arc<Self>) -> (SessionSubscription, mpsc::UnboundedReceiver<Session>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(move |s| {
            let _ = tx.send(s.clone());
        });
        (sub, rx)
    }

    fn unsubscribe(&self, id: u64) { self.listeners.write().retain(|(lid, _)| *lid != id); }

    fn bump_generation(&self) -> u64 {
        let mut st = self.state.write();
        st.generation += 1;
        st.generation
    }

    fn clear_cache(&self) {
        if let Err(e) = self.cache.clear() {
            warn!(target: "clinic::session", "failed to clear session cache: {}", e);
        }
    }

    fn spawn_lookup(self: &Arc<Self>, identity: Identity, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.resolve_role(identity, generation).await });
    }

    async fn resolve_role(self: Arc<Self>, identity: Identity, generation: u64) {
        debug!(target: "clinic::session", "role lookup id={} generation={}", identity.id, generation);
        let result = self.store.get(&self.users_collection, &identity.id).await;

        let _g = self.publish.lock();
        let current_generation = self.state.read().generation;
        if current_generation != generation {
            debug!(
                target: "clinic::session",
                "discarding superseded role lookup id={} generation={} current={}",
                identity.id, generation, current_generation
            );
            return;
        }
        match result {
            Ok(doc) => {
                self.state.write().last_error = None;
                let raw = doc.get("role").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                match raw.parse::<Role>() {
                    Ok(role) => {
                        self.publish_locked(Some(identity.clone()), Some(role), SessionStatus::Ready, false);
                        let cached = CachedSession { identity, role: role.as_str().to_string() };
                        if let Err(e) = self.cache.save(&cached) {
                            warn!(target: "clinic::session", "session cache write failed: {}", e);
                        }
                    }
                    Err(_) => {
                        warn!(target: "clinic::session", "directory entry for id={} has no usable role ('{}')", identity.id, raw);
                        self.publish_locked(Some(identity), None, SessionStatus::Ready, false);
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                // Directory entry not propagated yet after signup.
                info!(target: "clinic::session", "no directory entry yet for id={}; role pending", identity.id);
                self.state.write().last_error = None;
                self.publish_locked(Some(identity), None, SessionStatus::Ready, false);
            }
            Err(e) => {
                warn!(target: "clinic::session", "role lookup failed for id={}: {}", identity.id, e);
                self.state.write().last_error =
                    Some(AppError::directory("role_lookup_failed".to_string(), format!("could not resolve role: {}", e.message())));
                self.publish_locked(Some(identity), None, SessionStatus::Error, false);
            }
        }
    }

    /// Caller must hold `self.publish`.
    fn publish_locked(&self, identity: Option<Identity>, role: Option<Role>, status: SessionStatus, provisional: bool) -> Session {
        let session = {
            let mut st = self.state.write();
            let revision = st.session.revision + 1;
            st.session = Session { identity, role, status, provisional, revision };
            st.session.clone()
        };
        info!(
            target: "clinic::session",
            revision = session.revision,
            status = ?session.status,
            role = ?session.role,
            provisional = session.provisional,
            "session transition"
        );
        let listeners: Vec<SessionListener> = self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(&session);
        }
        session
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

/// Listener registration; unsubscribes on drop.
pub struct SessionSubscription {
    manager: Weak<SessionManager>,
    id: Option<u64>,
}

impl SessionSubscription {
    pub fn unsubscribe(mut self) { self.release(); }

    fn release(&mut self) {
        if let (Some(id), Some(m)) = (self.id.take(), self.manager.upgrade()) {
            m.unsubscribe(id);
        }
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) { self.release(); }
}
