//! Portal configuration.
//!
//! Settings come from an optional JSON file (`CLINIC_CONFIG`) with per-field defaults, then
//! individual `CLINIC_*` environment variables override single fields. A missing or broken
//! file never stops startup; defaults are used instead.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Names of the collections the portal reads and writes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CollectionNames {
    #[serde(default = "CollectionNames::default_users")]
    pub users: String,
    #[serde(default = "CollectionNames::default_patients")]
    pub patients: String,
    #[serde(default = "CollectionNames::default_appointments")]
    pub appointments: String,
    #[serde(default = "CollectionNames::default_medical_history")]
    pub medical_history: String,
}

impl CollectionNames {
    fn default_users() -> String { "users".to_string() }
    fn default_patients() -> String { "patients".to_string() }
    fn default_appointments() -> String { "appointments".to_string() }
    fn default_medical_history() -> String { "medical_history".to_string() }
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            users: Self::default_users(),
            patients: Self::default_patients(),
            appointments: Self::default_appointments(),
            medical_history: Self::default_medical_history(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PortalConfig {
    /// File backing the session cache. `None` keeps the cache in memory only.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// Key under which the last-known session is stored.
    #[serde(default = "PortalConfig::default_cache_key")]
    pub cache_key: String,
    #[serde(default)]
    pub collections: CollectionNames,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "PortalConfig::default_log_filter")]
    pub log_filter: String,
}

impl PortalConfig {
    fn default_cache_key() -> String { "hospital_user".to_string() }
    fn default_log_filter() -> String { "info".to_string() }

    /// Load settings from a JSON file. Missing or unparsable files yield defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<PortalConfig>(&bytes) {
                Ok(cfg) => {
                    debug!(target: "clinic::config", "loaded config from '{}'", path.display());
                    cfg
                }
                Err(e) => {
                    warn!(target: "clinic::config", "ignoring unparsable config '{}': {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Build configuration from `CLINIC_CONFIG` plus per-field environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match lookup("CLINIC_CONFIG") {
            Some(p) if !p.trim().is_empty() => Self::load_or_default(p.trim()),
            _ => Self::default(),
        };
        if let Some(p) = lookup("CLINIC_CACHE_PATH").filter(|s| !s.trim().is_empty()) {
            cfg.cache_path = Some(PathBuf::from(p.trim()));
        }
        if let Some(k) = lookup("CLINIC_CACHE_KEY").filter(|s| !s.trim().is_empty()) {
            cfg.cache_key = k.trim().to_string();
        }
        if let Some(f) = lookup("CLINIC_LOG").filter(|s| !s.trim().is_empty()) {
            cfg.log_filter = f.trim().to_string();
        }
        cfg
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            cache_key: Self::default_cache_key(),
            collections: CollectionNames::default(),
            log_filter: Self::default_log_filter(),
        }
    }
}
