//! Runtime configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//! Durations are stored in milliseconds.

use crate::error::SlateError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlateConfig {
    /// Sync manager timing and retries
    pub sync: SyncConfig,
    /// Query cache freshness
    pub cache: CacheConfig,
    /// Local mirror location and expiry
    pub mirror: MirrorConfig,
    /// Partner notifications
    pub notifications: NotificationConfig,
}

impl SlateConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML document
    ///
    /// # Errors
    /// `SlateError::Config` when the document is malformed
    pub fn from_toml_str(text: &str) -> Result<Self, SlateError> {
        toml::from_str(text).map_err(|e| SlateError::Config(e.to_string()))
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `SlateError::Config` when the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SlateError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SlateError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// `SlateError::Config` if serialization fails
    pub fn to_toml_string(&self) -> Result<String, SlateError> {
        toml::to_string_pretty(self).map_err(|e| SlateError::Config(e.to_string()))
    }

    /// With sync interval
    #[inline]
    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync.interval_ms = millis(interval);
        self
    }

    /// With delay before the first sync
    #[inline]
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.sync.initial_delay_ms = millis(delay);
        self
    }

    /// With points refresh retry policy
    #[inline]
    #[must_use]
    pub fn with_points_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.sync.points_retry_attempts = attempts;
        self.sync.points_retry_backoff_ms = millis(backoff);
        self
    }

    /// With cache stale time
    #[inline]
    #[must_use]
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.cache.stale_time_ms = millis(stale_time);
        self
    }

    /// With mirror directory
    #[inline]
    #[must_use]
    pub fn with_mirror_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mirror.dir = dir.into();
        self
    }

    /// With mirror time-to-live
    #[inline]
    #[must_use]
    pub fn with_mirror_ttl(mut self, ttl: Duration) -> Self {
        self.mirror.ttl_ms = millis(ttl);
        self
    }
}

/// Sync manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between sync cycles
    pub interval_ms: u64,
    /// Delay before the first cycle
    pub initial_delay_ms: u64,
    /// Attempts for the balance read of a cycle
    pub points_retry_attempts: u32,
    /// Base backoff between those attempts
    pub points_retry_backoff_ms: u64,
}

impl SyncConfig {
    /// Time between timer-driven syncs
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Delay before the first sync after start
    #[inline]
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Wait before retry number `attempt` (1-based): linear backoff
    #[inline]
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.points_retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            initial_delay_ms: 2_000,
            points_retry_attempts: 3,
            points_retry_backoff_ms: 1_000,
        }
    }
}

/// Query cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which cached data is stale
    pub stale_time_ms: u64,
}

impl CacheConfig {
    /// Age after which cached data is refetched on read
    #[inline]
    #[must_use]
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 5 * 60 * 1_000,
        }
    }
}

/// Local mirror settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Directory of the file mirror
    pub dir: PathBuf,
    /// Age after which a mirrored collection is ignored
    pub ttl_ms: u64,
}

impl MirrorConfig {
    /// Age after which a mirrored collection is ignored
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".slate/mirror"),
            ttl_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

/// Partner notification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Send pushes to the linked partner
    pub partner_push: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { partner_push: true }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
