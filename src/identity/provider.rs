use std::collections::HashMap;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use password_hash::{PasswordHash, SaltString};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::principal::Identity;
use crate::error::IdentityError;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Stream of identity changes. Yields the provider's current identity first, then every change.
pub struct IdentityFeed {
    events: mpsc::UnboundedReceiver<Option<Identity>>,
    cancel: Option<CancelFn>,
}

impl IdentityFeed {
    pub fn new(events: mpsc::UnboundedReceiver<Option<Identity>>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { events, cancel: Some(Box::new(cancel)) }
    }

    /// `None` once the provider has gone away; `Some(None)` means signed out.
    pub async fn next(&mut self) -> Option<Option<Identity>> { self.events.recv().await }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.events.close();
    }
}

impl Drop for IdentityFeed {
    fn drop(&mut self) { self.unsubscribe(); }
}

/// Capability interface of the external identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, secret: &str) -> Result<Identity, IdentityError>;
    /// Create an account and sign it in.
    async fn sign_up(&self, email: &str, secret: &str) -> Result<Identity, IdentityError>;
    async fn sign_out(&self) -> Result<(), IdentityError>;
    fn on_change(&self) -> IdentityFeed;
}

pub type SharedIdentityProvider = Arc<dyn IdentityProvider>;

fn gen_id() -> String {
    // 168-bit random id, base64url without padding (28 chars)
    let mut buf = [0u8; 21];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

// Interactive-login cost profile: 8 MiB, 2 passes.
fn hasher() -> Argon2<'static> {
    match Params::new(8 * 1024, 2, 1, None) {
        Ok(params) => Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        Err(_) => Argon2::default(),
    }
}

fn hash_password(password: &str) -> Option<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).ok()?;
    let salt = SaltString::encode_b64(&salt_bytes).ok()?;
    hasher().hash_password(password.as_bytes(), &salt).ok().map(|h| h.to_string())
}

fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        hasher().verify_password(password.as_bytes(), &parsed).is_ok()
    } else {
        false
    }
}

struct Account {
    identity: Identity,
    phc: String,
}

struct Inner {
    /// lowercased email -> account
    accounts: HashMap<String, Account>,
    current: Option<Identity>,
    listeners: HashMap<u64, mpsc::UnboundedSender<Option<Identity>>>,
    next_listener: u64,
    online: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self { accounts: HashMap::new(), current: None, listeners: HashMap::new(), next_listener: 0, online: true }
    }
}

impl Inner {
    fn emit(&mut self) {
        let current = self.current.clone();
        self.listeners.retain(|_, tx| tx.send(current.clone()).is_ok());
    }
}

/// In-process identity provider with Argon2-hashed secrets.
#[derive(Clone, Default)]
pub struct LocalIdentityProvider {
    inner: Arc<Mutex<Inner>>,
}

impl LocalIdentityProvider {
    pub fn new() -> Self { Self::default() }

    /// Simulate network loss. While offline every call fails with `NetworkUnavailable`.
    pub fn set_online(&self, online: bool) { self.inner.lock().online = online; }

    /// Register an account without signing it in.
    pub fn seed_account(&self, email: &str, secret: &str) -> Result<Identity, IdentityError> {
        let mut g = self.inner.lock();
        Self::create_account(&mut g, email, secret)
    }

    pub fn current(&self) -> Option<Identity> { self.inner.lock().current.clone() }

    pub fn listener_count(&self) -> usize { self.inner.lock().listeners.len() }

    fn create_account(g: &mut Inner, email: &str, secret: &str) -> Result<Identity, IdentityError> {
        let key = email.trim().to_ascii_lowercase();
        if key.is_empty() || secret.is_empty() {
            return Err(IdentityError::InvalidCredentials);
        }
        if g.accounts.contains_key(&key) {
            return Err(IdentityError::AccountExists(email.trim().to_string()));
        }
        let phc = hash_password(secret).ok_or(IdentityError::InvalidCredentials)?;
        let identity = Identity::new(gen_id(), email.trim());
        g.accounts.insert(key, Account { identity: identity.clone(), phc });
        debug!(target: "clinic::identity", "account created id={}", identity.id);
        Ok(identity)
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_in(&self, email: &str, secret: &str) -> Result<Identity, IdentityError> {
        let mut g = self.inner.lock();
        if !g.online {
            return Err(IdentityError::NetworkUnavailable);
        }
        let key = email.trim().to_ascii_lowercase();
        let identity = match g.accounts.get(&key) {
            Some(acct) if verify_password(&acct.phc, secret) => acct.identity.clone(),
            _ => return Err(IdentityError::InvalidCredentials),
        };
        g.current = Some(identity.clone());
        g.emit();
        info!(target: "clinic::identity", "sign_in id={}", identity.id);
        Ok(identity)
    }

    async fn sign_up(&self, email: &str, secret: &str) -> Result<Identity, IdentityError> {
        let mut g = self.inner.lock();
        if !g.online {
            return Err(IdentityError::NetworkUnavailable);
        }
        let identity = Self::create_account(&mut g, email, secret)?;
        g.current = Some(identity.clone());
        g.emit();
        info!(target: "clinic::identity", "sign_up id={}", identity.id);
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        let mut g = self.inner.lock();
        if !g.online {
            return Err(IdentityError::NetworkUnavailable);
        }
        if g.current.take().is_some() {
            g.emit();
        }
        info!(target: "clinic::identity", "sign_out");
        Ok(())
    }

    fn on_change(&self) -> IdentityFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut g = self.inner.lock();
            let id = g.next_listener;
            g.next_listener += 1;
            let _ = tx.send(g.current.clone());
            g.listeners.insert(id, tx);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        IdentityFeed::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.remove(&id);
            }
        })
    }
}
