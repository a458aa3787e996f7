//! Background reconciliation with the server
//!
//! The driver task multiplexes three sources:
//! - a timer: first cycle after `initial_delay`, then every `interval`,
//!   missed ticks skipped
//! - realtime row changes: a change to the user's profile invalidates the
//!   points balance only
//! - connectivity: going back online with parked mutations resumes them and
//!   invalidates the critical keys once
//!
//! A cycle invalidates the critical keys and refreshes the balance with
//! linear backoff. Only one cycle runs at a time; a tick that arrives while
//! one is running is dropped.

use crate::connectivity::{Connectivity, PausedMutations};
use crate::keys;
use crate::notify::{Notice, Notifier};
use chrono::Utc;
use slate_cache::{PreferenceStore, QueryCache, LAST_SYNC_AT};
use slate_core::{PointsBalance, SlateError, SlateResult, SyncConfig, UserId};
use slate_remote::{ChangeEvent, ProfileAccessor, Table};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What a call to [`SyncManager::sync_now`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A full cycle ran
    Completed { balance: PointsBalance },
    /// Another cycle was already running
    Skipped,
}

#[derive(Debug, Default)]
struct Counters {
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    ticks_skipped: AtomicU64,
    realtime_invalidations: AtomicU64,
    forced_syncs: AtomicU64,
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Cycles that refreshed the balance
    pub cycles_completed: u64,
    /// Cycles whose balance read failed after every attempt
    pub cycles_failed: u64,
    /// Cycle requests skipped because one was already running
    pub ticks_skipped: u64,
    /// Remote profile changes that invalidated the balance
    pub realtime_invalidations: u64,
    /// Calls to [`SyncManager::force_sync_now`]
    pub forced_syncs: u64,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Keeps the critical keys of one user fresh
#[derive(Clone)]
pub struct SyncManager {
    cache: QueryCache,
    config: SyncConfig,
    user: UserId,
    profiles: ProfileAccessor,
    notifier: Arc<dyn Notifier>,
    connectivity: Connectivity,
    paused: PausedMutations,
    prefs: PreferenceStore,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl SyncManager {
    /// Manager for `user`; nothing runs until [`start`](Self::start)
    #[must_use]
    pub fn new(
        cache: QueryCache,
        config: SyncConfig,
        user: UserId,
        profiles: ProfileAccessor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cache,
            config,
            user,
            profiles,
            notifier,
            connectivity: Connectivity::default(),
            paused: PausedMutations::new(),
            prefs: PreferenceStore::in_memory(),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Watch `connectivity` and resume `paused` on reconnect
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Connectivity, paused: PausedMutations) -> Self {
        self.connectivity = connectivity;
        self.paused = paused;
        self
    }

    /// Record the last successful sync in `prefs`
    #[must_use]
    pub fn with_prefs(mut self, prefs: PreferenceStore) -> Self {
        self.prefs = prefs;
        self
    }

    /// Whether the drive loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        let c = &self.counters;
        SyncStats {
            cycles_completed: c.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: c.cycles_failed.load(Ordering::Relaxed),
            ticks_skipped: c.ticks_skipped.load(Ordering::Relaxed),
            realtime_invalidations: c.realtime_invalidations.load(Ordering::Relaxed),
            forced_syncs: c.forced_syncs.load(Ordering::Relaxed),
        }
    }

    /// Run one cycle now unless one is already running
    ///
    /// # Errors
    /// `SyncCycleFailed` when the balance could not be refreshed within the
    /// configured attempts; the next tick tries again
    pub async fn sync_now(&self) -> SlateResult<SyncOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(user = %self.user, "sync already running, skipping");
            return Ok(SyncOutcome::Skipped);
        }
        let _running = RunningGuard(&self.running);
        let started = Instant::now();

        self.invalidate_critical();

        match self.refresh_points().await {
            Ok(balance) => {
                self.prefs.set(LAST_SYNC_AT, &Utc::now());
                self.counters.cycles_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    user = %self.user,
                    points = balance.points,
                    dom_points = balance.dom_points,
                    elapsed = ?started.elapsed(),
                    "sync cycle complete"
                );
                Ok(SyncOutcome::Completed { balance })
            }
            Err(err) => {
                self.counters.cycles_failed.fetch_add(1, Ordering::Relaxed);
                error!(user = %self.user, error = %err, "sync cycle failed");
                self.notifier
                    .notify(Notice::warning("Sync delayed", err.user_message()));
                Err(err)
            }
        }
    }

    /// Resume parked mutations, then invalidate the critical keys once
    ///
    /// Returns how many mutations were resumed.
    pub fn force_sync_now(&self) -> usize {
        let resumed = self.paused.resume();
        self.invalidate_critical();
        self.counters.forced_syncs.fetch_add(1, Ordering::Relaxed);
        info!(user = %self.user, resumed, "forced sync");
        resumed
    }

    /// Spawn the driver task
    ///
    /// Pass the backend's change feed to react to profile updates. Dropping
    /// the returned handle also stops the driver.
    #[must_use]
    pub fn start(&self, realtime: Option<broadcast::Receiver<ChangeEvent>>) -> SyncHandle {
        let (shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(self.clone().drive(stop, realtime));
        SyncHandle { shutdown, task }
    }

    fn invalidate_critical(&self) {
        for key in keys::critical(&self.user) {
            self.cache.invalidate(&key);
        }
    }

    async fn refresh_points(&self) -> SlateResult<PointsBalance> {
        let key = keys::points(&self.user);
        let attempts = self.config.points_retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let profiles = self.profiles.clone();
            let user = self.user.clone();
            let fetched = self
                .cache
                .fetch_with(&key, move || async move { profiles.fetch_balance(&user).await })
                .await;
            match fetched {
                Ok(balance) => return Ok(balance),
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "points refresh failed");
                    last_error = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay(attempt)).await;
                    }
                }
            }
        }

        Err(SlateError::SyncCycleFailed { attempts, last_error })
    }

    fn on_change(&self, event: &ChangeEvent) {
        if event.table != Table::Profiles || event.user_id.as_ref() != Some(&self.user) {
            return;
        }
        self.counters.realtime_invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(user = %self.user, kind = ?event.kind, "profile changed remotely");
        self.cache.invalidate(&keys::points(&self.user));
    }

    fn on_reconnect(&self) {
        let pending = self.paused.pending();
        if pending == 0 {
            debug!("back online, nothing parked");
            return;
        }
        info!(pending, "back online, resuming paused mutations");
        self.force_sync_now();
    }

    async fn drive(
        self,
        mut stop: oneshot::Receiver<()>,
        mut realtime: Option<broadcast::Receiver<ChangeEvent>>,
    ) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.initial_delay(),
            self.config.interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut online = self.connectivity.subscribe();
        let mut was_online = *online.borrow_and_update();

        info!(
            user = %self.user,
            interval_ms = self.config.interval_ms,
            initial_delay_ms = self.config.initial_delay_ms,
            "sync manager started"
        );

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        // failures are logged and notified inside
                        let _ = manager.sync_now().await;
                    });
                }
                change = next_change(&mut realtime) => match change {
                    Some(event) => self.on_change(&event),
                    None => {
                        warn!("realtime feed closed");
                        realtime = None;
                    }
                },
                Ok(()) = online.changed() => {
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        self.on_reconnect();
                    }
                    was_online = now_online;
                }
            }
        }

        info!(user = %self.user, "sync manager stopped");
    }
}

async fn next_change(realtime: &mut Option<broadcast::Receiver<ChangeEvent>>) -> Option<ChangeEvent> {
    let Some(receiver) = realtime else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "realtime feed lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager")
            .field("user", &self.user)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Handle to a running driver task
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Whether the drive loop has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the driver and wait for it to exit
    ///
    /// A cycle already spawned by the timer is left to finish.
    pub async fn shutdown(self) {
        // the driver may already be gone
        let _ = self.shutdown.send(());
        if let Err(error) = self.task.await {
            warn!(%error, "sync driver panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NoticeLevel, RecordingNotifier};
    use pretty_assertions::assert_eq;
    use slate_cache::CacheEvent;
    use slate_core::{Profile, Role};
    use slate_remote::{ChangeKind, MemoryBackend, Operation};
    use slate_core::RecordId;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        cache: QueryCache,
        notifier: RecordingNotifier,
        manager: SyncManager,
        user: UserId,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let user = UserId::new("sub");
        let backend = Arc::new(MemoryBackend::new());
        let mut profile = Profile::new(user.clone(), Role::Submissive);
        profile.points = 42;
        backend
            .seed(Table::Profiles, serde_json::to_value(&profile).unwrap())
            .unwrap();

        let cache = QueryCache::default();
        for key in keys::critical(&user) {
            cache.set_data(&key, ());
        }
        let notifier = RecordingNotifier::new();
        let manager = SyncManager::new(
            cache.clone(),
            config,
            user.clone(),
            ProfileAccessor::new(backend.clone()),
            Arc::new(notifier.clone()),
        );
        Fixture {
            backend,
            cache,
            notifier,
            manager,
            user,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            interval_ms: 30_000,
            initial_delay_ms: 2_000,
            points_retry_attempts: 3,
            points_retry_backoff_ms: 1_000,
        }
    }

    fn invalidations(events: &mut broadcast::Receiver<CacheEvent>) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        while let Ok(event) = events.try_recv() {
            if let CacheEvent::Invalidated(key) = event {
                *counts.entry(key.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    #[tokio::test]
    async fn cycle_refreshes_balance_and_records_time() {
        let fx = fixture(config());
        fx.cache.clear_data(&keys::points(&fx.user));

        let outcome = fx.manager.sync_now().await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                balance: PointsBalance::new(42, 0)
            }
        );
        assert!(fx.manager.prefs.get::<chrono::DateTime<Utc>>(LAST_SYNC_AT).is_some());
        assert_eq!(fx.manager.stats().cycles_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cycle_is_skipped() {
        let fx = fixture(config());
        fx.backend.set_latency(Duration::from_millis(100));

        let (first, second) = tokio::join!(fx.manager.sync_now(), fx.manager.sync_now());

        assert!(matches!(first.unwrap(), SyncOutcome::Completed { .. }));
        assert_eq!(second.unwrap(), SyncOutcome::Skipped);
        assert_eq!(fx.backend.calls(Operation::Select), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn points_retry_with_linear_backoff_then_give_up() {
        let fx = fixture(config());
        fx.backend.set_offline(true);
        let started = Instant::now();

        let err = fx.manager.sync_now().await.unwrap_err();

        assert!(matches!(err, SlateError::SyncCycleFailed { attempts: 3, .. }));
        assert_eq!(fx.backend.calls(Operation::Select), 3);
        // 1s + 2s between the three attempts
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(fx.notifier.with_level(NoticeLevel::Warning).len(), 1);
        assert!(!fx.manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_waits_for_initial_delay() {
        let fx = fixture(config());
        let handle = fx.manager.start(None);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fx.manager.stats().cycles_completed, 0);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(fx.manager.stats().cycles_completed, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.manager.stats().cycles_completed, 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn profile_change_invalidates_points_only() {
        let fx = fixture(config());
        let (changes, feed) = broadcast::channel(8);
        let mut events = fx.cache.subscribe();
        let handle = fx.manager.start(Some(feed));

        changes
            .send(ChangeEvent {
                table: Table::Profiles,
                kind: ChangeKind::Update,
                record_id: RecordId::new("sub"),
                user_id: Some(fx.user.clone()),
            })
            .unwrap();
        changes
            .send(ChangeEvent {
                table: Table::Profiles,
                kind: ChangeKind::Update,
                record_id: RecordId::new("dom"),
                user_id: Some(UserId::new("dom")),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let counts = invalidations(&mut events);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get(&keys::points(&fx.user).to_string()), Some(&1));
        assert_eq!(fx.manager.stats().realtime_invalidations, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_then_invalidates_critical_keys_once() {
        let fx = fixture(config());
        let connectivity = Connectivity::new(false);
        let paused = PausedMutations::new();
        let manager = fx.manager.clone().with_connectivity(connectivity.clone(), paused.clone());
        let handle = manager.start(None);

        let parked = {
            let paused = paused.clone();
            let connectivity = connectivity.clone();
            tokio::spawn(async move { paused.park(&connectivity).await })
        };
        while paused.pending() == 0 {
            tokio::task::yield_now().await;
        }
        let mut events = fx.cache.subscribe();

        connectivity.set_online(true);
        parked.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let counts = invalidations(&mut events);
        assert_eq!(counts.len(), keys::critical(&fx.user).len());
        assert!(counts.values().all(|count| *count == 1));
        assert_eq!(manager.stats().forced_syncs, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_without_parked_mutations_does_nothing() {
        let fx = fixture(config());
        let connectivity = Connectivity::new(false);
        let manager = fx
            .manager
            .clone()
            .with_connectivity(connectivity.clone(), PausedMutations::new());
        let handle = manager.start(None);
        tokio::task::yield_now().await;

        connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.stats().forced_syncs, 0);
        handle.shutdown().await;
    }
}
