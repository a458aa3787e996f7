//! Navy Slate Cache
//!
//! Client-side state for the sync layer:
//! - [`QueryCache`]: keyed, single-flight query cache with prefix invalidation
//! - [`Snapshot`]: pre-mutation captures for rollback
//! - [`MirrorStore`]: per-user persistent mirror for warm starts
//! - [`PreferenceStore`]: small persisted settings such as the last sync time

#![warn(unreachable_pub)]

pub mod key;
pub mod mirror;
pub mod prefs;
pub mod query;
pub mod snapshot;

pub use key::QueryKey;
pub use mirror::{
    FileMirror, LocalMirror, MemoryMirror, MirrorEntryInfo, MirrorError, MirrorKey, MirrorStore,
};
pub use prefs::{PreferenceStore, LAST_SYNC_AT};
pub use query::{CacheEvent, CacheStats, QueryCache};
pub use snapshot::{Restore, Snapshot};
