//! Persistent local mirror of cached collections
//!
//! Collections are mirrored per user so a cold start can render the last
//! known state before the first remote fetch. The mirror is best effort:
//! expired, unreadable or undecodable documents read as a miss, and write
//! failures are logged and swallowed.

mod file;
mod memory;

pub use file::FileMirror;
pub use memory::MemoryMirror;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slate_core::{MirrorConfig, UserId};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Document format version written by [`MirrorStore`]
pub const MIRROR_FORMAT_VERSION: u32 = 1;

/// Mirror storage errors
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Filesystem failure
    #[error("mirror io error at {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document could not be encoded or decoded
    #[error("mirror document for {key} is invalid: {reason}")]
    Format {
        /// Mirror key
        key: MirrorKey,
        /// Decoder message
        reason: String,
    },

    /// Backing store cannot be used
    #[error("mirror unavailable: {0}")]
    Unavailable(String),
}

impl MirrorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Location of one mirrored collection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorKey {
    /// Owning user
    pub user: UserId,
    /// Collection name, e.g. `tasks`
    pub collection: String,
}

impl MirrorKey {
    /// Key for `collection` of `user`
    #[inline]
    #[must_use]
    pub fn new(user: UserId, collection: impl Into<String>) -> Self {
        Self {
            user,
            collection: collection.into(),
        }
    }
}

impl fmt::Display for MirrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.collection)
    }
}

/// Raw document storage behind the typed [`MirrorStore`]
#[async_trait]
pub trait LocalMirror: Send + Sync + fmt::Debug {
    /// Read the stored document, `None` when absent
    async fn load_raw(&self, key: &MirrorKey) -> Result<Option<String>, MirrorError>;

    /// Replace the stored document
    async fn save_raw(&self, key: &MirrorKey, document: String) -> Result<(), MirrorError>;

    /// Remove every document of `user`; returns how many were removed
    async fn clear_user(&self, user: &UserId) -> Result<usize, MirrorError>;

    /// Collections stored for `user`
    async fn collections(&self, user: &UserId) -> Result<Vec<String>, MirrorError>;
}

#[derive(Serialize, Deserialize)]
struct MirrorDocument<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    items: T,
}

/// Summary of one stored document, for inspection tooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEntryInfo {
    /// Collection name
    pub collection: String,
    /// When the document was written
    pub saved_at: Option<DateTime<Utc>>,
    /// Document size in bytes
    pub bytes: usize,
    /// Whether the document is past its time-to-live
    pub expired: bool,
}

/// Typed, expiring view over a [`LocalMirror`]
#[derive(Debug, Clone)]
pub struct MirrorStore {
    backend: Arc<dyn LocalMirror>,
    ttl: Duration,
}

impl MirrorStore {
    /// Store over `backend` whose documents expire after `ttl`
    #[must_use]
    pub fn new(backend: Arc<dyn LocalMirror>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// File-backed store from configuration
    #[must_use]
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::new(Arc::new(FileMirror::new(&config.dir)), config.ttl())
    }

    /// In-memory store, mainly for tests and the simulator
    #[must_use]
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryMirror::new(ttl)), ttl)
    }

    /// Time-to-live of stored documents
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Load `collection` for `user`
    ///
    /// Returns `None` for missing, expired, unreadable or undecodable
    /// documents.
    pub async fn load<T: DeserializeOwned>(&self, user: &UserId, collection: &str) -> Option<T> {
        let key = MirrorKey::new(user.clone(), collection);
        let raw = match self.backend.load_raw(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%key, error = %e, "mirror read failed");
                return None;
            }
        };

        let document: MirrorDocument<T> = match serde_json::from_str(&raw) {
            Ok(document) => document,
            Err(e) => {
                warn!(%key, error = %e, "discarding undecodable mirror document");
                return None;
            }
        };
        if document.version != MIRROR_FORMAT_VERSION {
            debug!(%key, version = document.version, "ignoring mirror document of other version");
            return None;
        }
        if self.is_expired(document.saved_at) {
            debug!(%key, saved_at = %document.saved_at, "mirror document expired");
            return None;
        }
        Some(document.items)
    }

    /// Save `items` as `collection` for `user`; failures are logged
    pub async fn save<T: Serialize + Sync>(&self, user: &UserId, collection: &str, items: &T) {
        let key = MirrorKey::new(user.clone(), collection);
        if let Err(e) = self.try_save(&key, items).await {
            warn!(%key, error = %e, "mirror write failed");
        }
    }

    /// Save and report failures
    ///
    /// # Errors
    /// Encoding or backend failures
    pub async fn try_save<T: Serialize + Sync>(&self, key: &MirrorKey, items: &T) -> Result<(), MirrorError> {
        let document = MirrorDocument {
            version: MIRROR_FORMAT_VERSION,
            saved_at: Utc::now(),
            items,
        };
        let raw = serde_json::to_string(&document).map_err(|e| MirrorError::Format {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.backend.save_raw(key, raw).await
    }

    /// Remove everything stored for `user`
    ///
    /// # Errors
    /// Backend failures
    pub async fn clear_for_user(&self, user: &UserId) -> Result<usize, MirrorError> {
        let removed = self.backend.clear_user(user).await?;
        debug!(%user, removed, "cleared mirror");
        Ok(removed)
    }

    /// Describe each document stored for `user`
    ///
    /// # Errors
    /// Backend failures
    pub async fn inspect(&self, user: &UserId) -> Result<Vec<MirrorEntryInfo>, MirrorError> {
        let mut entries = Vec::new();
        for collection in self.backend.collections(user).await? {
            let key = MirrorKey::new(user.clone(), collection.clone());
            let Some(raw) = self.backend.load_raw(&key).await? else {
                continue;
            };
            let saved_at = serde_json::from_str::<MirrorDocument<serde_json::Value>>(&raw)
                .ok()
                .map(|document| document.saved_at);
            entries.push(MirrorEntryInfo {
                collection,
                saved_at,
                bytes: raw.len(),
                expired: saved_at.map_or(true, |at| self.is_expired(at)),
            });
        }
        entries.sort_by(|a, b| a.collection.cmp(&b.collection));
        Ok(entries)
    }

    fn is_expired(&self, saved_at: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(saved_at);
        age.to_std().map_or(false, |age| age > self.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user() -> UserId {
        UserId::new("user-1")
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = MirrorStore::in_memory(Duration::from_secs(60));
        store.save(&user(), "rules", &vec!["no phones".to_string()]).await;

        let loaded: Option<Vec<String>> = store.load(&user(), "rules").await;
        assert_eq!(loaded, Some(vec!["no phones".to_string()]));
    }

    #[tokio::test]
    async fn expired_document_is_a_miss() {
        let backend = Arc::new(MemoryMirror::new(Duration::from_secs(3_600)));
        let store = MirrorStore::new(backend.clone(), Duration::from_secs(60));
        let key = MirrorKey::new(user(), "tasks");
        let old = serde_json::json!({
            "version": MIRROR_FORMAT_VERSION,
            "saved_at": Utc::now() - chrono::Duration::hours(2),
            "items": [1, 2, 3],
        });
        backend.save_raw(&key, old.to_string()).await.unwrap();

        let loaded: Option<Vec<u32>> = store.load(&user(), "tasks").await;
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn corrupt_document_is_a_miss() {
        let backend = Arc::new(MemoryMirror::new(Duration::from_secs(60)));
        let store = MirrorStore::new(backend.clone(), Duration::from_secs(60));
        backend
            .save_raw(&MirrorKey::new(user(), "rewards"), "{not json".to_string())
            .await
            .unwrap();

        let loaded: Option<Vec<u32>> = store.load(&user(), "rewards").await;
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn inspect_lists_collections() {
        let store = MirrorStore::in_memory(Duration::from_secs(60));
        store.save(&user(), "tasks", &vec![1u8]).await;
        store.save(&user(), "rules", &vec![2u8]).await;

        let info = store.inspect(&user()).await.unwrap();
        let names: Vec<_> = info.iter().map(|e| e.collection.as_str()).collect();
        assert_eq!(names, vec!["rules", "tasks"]);
        assert!(info.iter().all(|e| !e.expired && e.saved_at.is_some()));
    }
}
