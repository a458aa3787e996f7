//! Pre-mutation snapshots of cache entries

use crate::key::QueryKey;
use crate::query::QueryCache;

/// The value a key held before an optimistic edit
///
/// Restoring writes the captured value back whole. A key that was empty is
/// cleared again rather than left holding the optimistic value.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    key: QueryKey,
    previous: Option<T>,
}

impl<T: Clone + Send + Sync + 'static> Snapshot<T> {
    /// Snapshot of `previous` for `key`
    #[inline]
    #[must_use]
    pub fn new(key: QueryKey, previous: Option<T>) -> Self {
        Self { key, previous }
    }

    /// Key this snapshot was taken from
    #[inline]
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Captured value
    #[inline]
    #[must_use]
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    /// Write the captured value back
    pub fn restore(&self, cache: &QueryCache) {
        match &self.previous {
            Some(value) => cache.set_data(&self.key, value.clone()),
            None => cache.clear_data(&self.key),
        }
    }
}

/// Type-erased snapshot, so snapshots of different entry types can be
/// collected and restored together
pub trait Restore: Send + Sync {
    /// Key the snapshot belongs to
    fn key(&self) -> &QueryKey;

    /// Write the captured value back
    fn restore(&self, cache: &QueryCache);
}

impl<T: Clone + Send + Sync + 'static> Restore for Snapshot<T> {
    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn restore(&self, cache: &QueryCache) {
        Snapshot::restore(self, cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_brings_back_previous_value() {
        let cache = QueryCache::default();
        let key = QueryKey::new("rewards");
        cache.set_data(&key, vec!["a".to_string()]);

        let snapshot = cache.snapshot::<Vec<String>>(&key);
        cache.set_data(&key, vec!["a".to_string(), "optimistic".to_string()]);
        snapshot.restore(&cache);

        assert_eq!(cache.get_data::<Vec<String>>(&key), Some(vec!["a".to_string()]));
    }

    #[test]
    fn restore_of_empty_key_clears_it() {
        let cache = QueryCache::default();
        let key = QueryKey::new("points").with("u1");

        let snapshot: Box<dyn Restore> = Box::new(cache.snapshot::<i64>(&key));
        cache.set_data(&key, 40i64);
        snapshot.restore(&cache);

        assert!(cache.get_data::<i64>(&key).is_none());
        assert_eq!(snapshot.key(), &key);
    }
}
