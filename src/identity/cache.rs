//! Persisted last-known session.
//!
//! The cache lets the UI render optimistically before the identity provider answers. Absence
//! and parse failures both mean "no cached session"; neither is ever fatal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::principal::Identity;
use crate::error::{AppError, AppResult};

/// Serialized form of a cached session: `{identity: {id, email}, role}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedSession {
    pub identity: Identity,
    pub role: String,
}

pub trait SessionCache: Send + Sync {
    fn load(&self) -> Option<CachedSession>;
    fn save(&self, session: &CachedSession) -> AppResult<()>;
    fn clear(&self) -> AppResult<()>;
}

pub type SharedSessionCache = Arc<dyn SessionCache>;

/// In-memory cache. Counts writes so callers can assert persistence behaviour.
#[derive(Default)]
pub struct MemorySessionCache {
    slot: Mutex<Option<CachedSession>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemorySessionCache {
    pub fn new() -> Self { Self::default() }

    pub fn with_session(session: CachedSession) -> Self {
        let c = Self::default();
        *c.slot.lock() = Some(session);
        c
    }

    pub fn write_count(&self) -> usize { self.writes.load(Ordering::SeqCst) }

    /// Make every subsequent save fail, as a full or blocked storage area would.
    pub fn set_fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }
}

impl SessionCache for MemorySessionCache {
    fn load(&self) -> Option<CachedSession> { self.slot.lock().clone() }

    fn save(&self, session: &CachedSession) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::internal("cache_write_failed", "session cache rejected the write"));
        }
        *self.slot.lock() = Some(session.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> AppResult<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// File-backed cache: one JSON object mapping keys to opaque serialized records.
pub struct FileSessionCache {
    path: PathBuf,
    key: String,
    lock: Mutex<()>,
}

impl FileSessionCache {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self { path: path.into(), key: key.into(), lock: Mutex::new(()) }
    }

    fn read_map(&self) -> HashMap<String, String> {
        let Ok(bytes) = std::fs::read(&self.path) else { return HashMap::new() };
        match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(target: "clinic::cache", "ignoring unreadable session cache '{}': {}", self.path.display(), e);
                HashMap::new()
            }
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> AppResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).ok();
        }
        let bytes = serde_json::to_vec_pretty(map).map_err(|e| AppError::internal("cache_encode".to_string(), e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| AppError::internal("cache_write_failed".to_string(), e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| AppError::internal("cache_write_failed".to_string(), e.to_string()))?;
        Ok(())
    }
}

impl SessionCache for FileSessionCache {
    fn load(&self) -> Option<CachedSession> {
        let _g = self.lock.lock();
        let raw = self.read_map().remove(&self.key)?;
        match serde_json::from_str::<CachedSession>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(target: "clinic::cache", "cached session under '{}' is malformed: {}", self.key, e);
                None
            }
        }
    }

    fn save(&self, session: &CachedSession) -> AppResult<()> {
        let _g = self.lock.lock();
        let raw = serde_json::to_string(session).map_err(|e| AppError::internal("cache_encode".to_string(), e.to_string()))?;
        let mut map = self.read_map();
        map.insert(self.key.clone(), raw);
        self.write_map(&map)?;
        debug!(target: "clinic::cache", "session cached under '{}'", self.key);
        Ok(())
    }

    fn clear(&self) -> AppResult<()> {
        let _g = self.lock.lock();
        let mut map = self.read_map();
        if map.remove(&self.key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}
