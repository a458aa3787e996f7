//! Small key/value preference store
//!
//! Holds bookkeeping such as the last successful sync time. Backed by a JSON
//! file when a path is given; a missing or corrupt file starts empty.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Preference key for the last completed sync (RFC 3339)
pub const LAST_SYNC_AT: &str = "last_sync_at";

/// Thread-safe preference map
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: Option<PathBuf>,
    values: Arc<Mutex<Map<String, Value>>>,
}

impl PreferenceStore {
    /// Store persisted at `path`
    #[must_use]
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt preference file");
                Map::new()
            }),
            Err(_) => Map::new(),
        };
        Self {
            path: Some(path),
            values: Arc::new(Mutex::new(values)),
        }
    }

    /// Store that is never written to disk
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Arc::new(Mutex::new(Map::new())),
        }
    }

    /// Read `key` as `T`
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.lock().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Write `key`
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let Ok(value) = serde_json::to_value(value) else {
            warn!(key, "preference value not serializable");
            return;
        };
        self.values.lock().insert(key.to_string(), value);
        self.flush();
    }

    /// Remove `key`
    pub fn remove(&self, key: &str) {
        if self.values.lock().remove(key).is_some() {
            self.flush();
        }
    }

    fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let raw = match serde_json::to_string_pretty(&*self.values.lock()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to encode preferences");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "failed to create preference dir");
                return;
            }
        }
        if let Err(e) = std::fs::write(path, raw) {
            warn!(path = %path.display(), error = %e, "failed to write preferences");
        }
    }
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
