//! Keyed query cache
//!
//! One process-wide store of fetched collections and scalars, constructed
//! explicitly and passed by handle. Entries hold type-erased values that are
//! always replaced whole, so readers see either the last known-good value or
//! an optimistic one, never a partial write.
//!
//! Fetches are single-flight per key: concurrent readers share one in-flight
//! future. Every write detaches the in-flight fetch for that key, so a
//! response that started before an optimistic write is discarded instead of
//! clobbering it.

use crate::key::QueryKey;
use crate::snapshot::Snapshot;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use slate_core::{CacheConfig, SlateError};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

type ErasedValue = Arc<dyn Any + Send + Sync>;
type ErasedFuture = BoxFuture<'static, Result<ErasedValue, SlateError>>;
type ErasedFetcher = Arc<dyn Fn() -> ErasedFuture + Send + Sync>;
type SharedFetch = Shared<ErasedFuture>;

const EVENT_CAPACITY: usize = 256;

/// Change notification published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Entry data replaced (fetch result or direct write)
    Updated(QueryKey),
    /// Entry marked stale
    Invalidated(QueryKey),
    /// Entry data removed
    Removed(QueryKey),
}

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of keys known to the cache
    pub entry_count: usize,
    /// Number of fetches currently in flight
    pub in_flight: usize,
    /// Fetches started since construction
    pub fetches_started: u64,
}

#[derive(Default)]
struct Entry {
    data: Option<ErasedValue>,
    updated_at: Option<Instant>,
    stale: bool,
    in_flight: Option<InFlight>,
    fetcher: Option<ErasedFetcher>,
}

struct InFlight {
    id: u64,
    future: SharedFetch,
}

enum Begin {
    Ready(ErasedValue),
    Pending(SharedFetch),
}

struct Inner {
    entries: DashMap<QueryKey, Entry>,
    stale_time: Duration,
    events: broadcast::Sender<CacheEvent>,
    next_fetch_id: AtomicU64,
    fetches_started: AtomicU64,
}

impl Inner {
    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_fresh(&self, entry: &Entry) -> bool {
        entry.data.is_some()
            && !entry.stale
            && entry
                .updated_at
                .is_some_and(|at| at.elapsed() < self.stale_time)
    }

    /// Store a fetch result if the fetch is still the entry's current one
    fn complete(
        &self,
        key: &QueryKey,
        id: u64,
        result: Result<ErasedValue, SlateError>,
    ) -> Result<ErasedValue, SlateError> {
        {
            let Some(mut entry) = self.entries.get_mut(key) else {
                debug!(%key, fetch_id = id, "entry removed while fetching, discarding result");
                return Err(SlateError::Cancelled);
            };
            if !entry.in_flight.as_ref().is_some_and(|f| f.id == id) {
                debug!(%key, fetch_id = id, "discarding superseded fetch");
                return Err(SlateError::Cancelled);
            }
            entry.in_flight = None;

            match &result {
                Ok(value) => {
                    entry.data = Some(Arc::clone(value));
                    entry.stale = false;
                    entry.updated_at = Some(Instant::now());
                }
                Err(e) => {
                    warn!(%key, error = %e, "fetch failed, keeping previous data");
                    return result;
                }
            }
        }
        self.emit(CacheEvent::Updated(key.clone()));
        result
    }
}

/// Shared handle to the query cache
///
/// Cloning is cheap; all clones see the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    /// Create cache whose entries go stale after `stale_time`
    #[must_use]
    pub fn new(stale_time: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                stale_time,
                events,
                next_fetch_id: AtomicU64::new(1),
                fetches_started: AtomicU64::new(0),
            }),
        }
    }

    /// Create cache from configuration
    #[inline]
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.stale_time())
    }

    /// Current value for `key`, if present and of type `T`
    #[must_use]
    pub fn get_data<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        let data = self.inner.entries.get(key)?.data.clone()?;
        data.downcast_ref::<T>().cloned()
    }

    /// Replace the value for `key`
    ///
    /// Detaches any in-flight fetch for the key; its result will be discarded.
    pub fn set_data<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        self.write(key, Arc::new(value), false);
    }

    /// Replace the value for `key` but leave it marked stale
    ///
    /// Used for warm starts: the value is served immediately and the next
    /// read still goes to the server.
    pub fn seed_data<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        self.write(key, Arc::new(value), true);
    }

    /// Compute a new value from the current one and store it atomically
    ///
    /// `f` runs while the entry is locked and must not touch the cache.
    /// Returning `None` clears the entry's data.
    pub fn update_data<T, F>(&self, key: &QueryKey, f: F) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let next = {
            let mut entry = self.inner.entries.entry(key.clone()).or_default();
            let current = entry
                .data
                .as_ref()
                .and_then(|data| data.downcast_ref::<T>())
                .cloned();
            let next = f(current);
            match &next {
                Some(value) => {
                    entry.data = Some(Arc::new(value.clone()));
                    entry.updated_at = Some(Instant::now());
                    entry.stale = false;
                }
                None => {
                    entry.data = None;
                    entry.updated_at = None;
                }
            }
            entry.in_flight = None;
            next
        };

        let event = if next.is_some() {
            CacheEvent::Updated(key.clone())
        } else {
            CacheEvent::Removed(key.clone())
        };
        self.inner.emit(event);
        next
    }

    /// Drop the value for `key`, keeping its registered fetcher
    pub fn clear_data(&self, key: &QueryKey) {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.data = None;
            entry.updated_at = None;
            entry.stale = false;
            entry.in_flight = None;
        } else {
            return;
        }
        self.inner.emit(CacheEvent::Removed(key.clone()));
    }

    /// Capture the current value of `key` for later restore
    #[must_use]
    pub fn snapshot<T: Clone + Send + Sync + 'static>(&self, key: &QueryKey) -> Snapshot<T> {
        Snapshot::new(key.clone(), self.get_data(key))
    }

    /// Register the fetcher used by [`fetch`](Self::fetch) and background refetches
    pub fn register_fetcher<T, F, Fut>(&self, key: &QueryKey, fetcher: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SlateError>> + Send + 'static,
    {
        let erased: ErasedFetcher = Arc::new(move || erase(fetcher()));
        self.inner.entries.entry(key.clone()).or_default().fetcher = Some(erased);
    }

    /// Whether a fetcher is registered for `key`
    #[must_use]
    pub fn has_fetcher(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.fetcher.is_some())
    }

    /// Read `key`, fetching with the registered fetcher when stale or missing
    ///
    /// # Errors
    /// The fetcher's error, `SlateError::Cancelled` when the fetch was
    /// cancelled and nothing is cached, or `SlateError::Config` when there is
    /// neither data nor a fetcher.
    pub async fn fetch<T: Clone + Send + Sync + 'static>(&self, key: &QueryKey) -> Result<T, SlateError> {
        let begin = self.begin(key, |entry| entry.fetcher.as_ref().map(|f| f()))?;
        self.resolve(key, begin).await
    }

    /// Read `key`, fetching with `fetcher` when stale or missing
    ///
    /// # Errors
    /// Same as [`fetch`](Self::fetch).
    pub async fn fetch_with<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T, SlateError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SlateError>> + Send + 'static,
    {
        let begin = self.begin(key, |_| Some(erase(fetcher())))?;
        self.resolve(key, begin).await
    }

    /// Mark `key` stale and read it again through its registered fetcher
    ///
    /// Joins a fetch already in flight instead of starting a second one.
    ///
    /// # Errors
    /// Same as [`fetch`](Self::fetch).
    pub async fn refetch<T: Clone + Send + Sync + 'static>(&self, key: &QueryKey) -> Result<T, SlateError> {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.stale = true;
        }
        self.fetch(key).await
    }

    /// Mark every entry under `prefix` stale
    ///
    /// Entries with a registered fetcher are refetched in the background,
    /// unless a fetch for them is already in flight. Returns the number of
    /// entries invalidated.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut matched = Vec::new();
        let mut refetch = Vec::new();

        for mut entry in self.inner.entries.iter_mut() {
            if !entry.key().starts_with(prefix) {
                continue;
            }
            let key = entry.key().clone();
            let value = entry.value_mut();
            value.stale = true;
            if value.fetcher.is_some() && value.in_flight.is_none() {
                refetch.push(key.clone());
            }
            matched.push(key);
        }

        for key in &matched {
            self.inner.emit(CacheEvent::Invalidated(key.clone()));
        }
        for key in &refetch {
            self.spawn_refetch(key);
        }

        debug!(%prefix, invalidated = matched.len(), refetching = refetch.len(), "invalidated");
        matched.len()
    }

    /// Detach in-flight fetches under `prefix`; their results are discarded
    ///
    /// The underlying remote calls are not aborted. Returns the number of
    /// fetches detached.
    pub fn cancel_queries(&self, prefix: &QueryKey) -> usize {
        let mut cancelled = 0;
        for mut entry in self.inner.entries.iter_mut() {
            if entry.key().starts_with(prefix) && entry.value_mut().in_flight.take().is_some() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(%prefix, cancelled, "cancelled in-flight fetches");
        }
        cancelled
    }

    /// Remove every entry under `prefix`, fetchers included
    pub fn remove(&self, prefix: &QueryKey) -> usize {
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &keys {
            self.inner.entries.remove(key);
            self.inner.emit(CacheEvent::Removed(key.clone()));
        }
        keys.len()
    }

    /// Remove everything
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Whether a read of `key` would go to the server
    #[must_use]
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .get(key)
            .map_or(true, |entry| !self.inner.is_fresh(&entry))
    }

    /// Whether a fetch for `key` is in flight
    #[must_use]
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.in_flight.is_some())
    }

    /// Whether `key` holds data
    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.data.is_some())
    }

    /// Known keys
    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        self.inner.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Subscribe to change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entries.len(),
            in_flight: self
                .inner
                .entries
                .iter()
                .filter(|entry| entry.in_flight.is_some())
                .count(),
            fetches_started: self.inner.fetches_started.load(Ordering::Relaxed),
        }
    }

    fn write(&self, key: &QueryKey, value: ErasedValue, stale: bool) {
        {
            let mut entry = self.inner.entries.entry(key.clone()).or_default();
            entry.data = Some(value);
            entry.stale = stale;
            entry.updated_at = Some(Instant::now());
            if let Some(in_flight) = entry.in_flight.take() {
                debug!(%key, fetch_id = in_flight.id, "write superseded in-flight fetch");
            }
        }
        self.inner.emit(CacheEvent::Updated(key.clone()));
    }

    /// Join the in-flight fetch, serve fresh data, or start a fetch via `start`
    fn begin<S>(&self, key: &QueryKey, start: S) -> Result<Begin, SlateError>
    where
        S: FnOnce(&Entry) -> Option<ErasedFuture>,
    {
        let mut entry = self.inner.entries.entry(key.clone()).or_default();

        if let Some(in_flight) = &entry.in_flight {
            return Ok(Begin::Pending(in_flight.future.clone()));
        }
        if self.inner.is_fresh(&entry) {
            if let Some(data) = &entry.data {
                return Ok(Begin::Ready(Arc::clone(data)));
            }
        }

        let Some(future) = start(&entry) else {
            // No way to fetch: serve whatever is cached, stale or not
            return match &entry.data {
                Some(data) => Ok(Begin::Ready(Arc::clone(data))),
                None => Err(SlateError::Config(format!("no fetcher registered for {key}"))),
            };
        };

        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let owned_key = key.clone();
        let shared = async move {
            let result = future.await;
            inner.complete(&owned_key, id, result)
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            id,
            future: shared.clone(),
        });
        self.inner.fetches_started.fetch_add(1, Ordering::Relaxed);
        debug!(%key, fetch_id = id, "starting fetch");

        Ok(Begin::Pending(shared))
    }

    async fn resolve<T: Clone + 'static>(&self, key: &QueryKey, begin: Begin) -> Result<T, SlateError> {
        let value = match begin {
            Begin::Ready(value) => value,
            Begin::Pending(future) => match future.await {
                Ok(value) => value,
                Err(SlateError::Cancelled) => self
                    .inner
                    .entries
                    .get(key)
                    .and_then(|entry| entry.data.clone())
                    .ok_or(SlateError::Cancelled)?,
                Err(e) => return Err(e),
            },
        };
        downcast(key, &value)
    }

    fn spawn_refetch(&self, key: &QueryKey) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(%key, "no runtime, refetch deferred to next read");
            return;
        };
        match self.begin(key, |entry| entry.fetcher.as_ref().map(|f| f())) {
            Ok(Begin::Pending(future)) => {
                handle.spawn(async move {
                    // Result is stored by the fetch itself
                    let _ = future.await;
                });
            }
            Ok(Begin::Ready(_)) => {}
            Err(e) => debug!(%key, error = %e, "background refetch not started"),
        }
    }
}

impl Default for QueryCache {
    /// Cache with the default five-minute stale time
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.entries.len())
            .field("stale_time", &self.inner.stale_time)
            .finish()
    }
}

fn erase<T, Fut>(future: Fut) -> ErasedFuture
where
    T: Send + Sync + 'static,
    Fut: Future<Output = Result<T, SlateError>> + Send + 'static,
{
    async move { future.await.map(|value| Arc::new(value) as ErasedValue) }.boxed()
}

fn downcast<T: Clone + 'static>(key: &QueryKey, value: &ErasedValue) -> Result<T, SlateError> {
    value.downcast_ref::<T>().cloned().ok_or_else(|| {
        SlateError::corruption(
            key.to_string(),
            format!("cached value is not a {}", std::any::type_name::<T>()),
        )
    })
}
