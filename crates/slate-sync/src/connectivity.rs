//! Online/offline state and the queue of mutations waiting for it

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Shared online flag
///
/// Transitions are published to subscribers; setting the current value again
/// is not a transition.
#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    /// Flag starting `online`
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    /// Current state
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Update the flag; returns whether it changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity changed");
        }
        changed
    }

    /// Receiver notified on every change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Mutations that applied their optimistic edit while offline and are
/// waiting to make their remote call
#[derive(Debug, Clone)]
pub struct PausedMutations {
    inner: Arc<PausedInner>,
}

#[derive(Debug)]
struct PausedInner {
    pending: AtomicUsize,
    release: watch::Sender<u64>,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PausedMutations {
    /// No parked mutations
    #[must_use]
    pub fn new() -> Self {
        let (release, _) = watch::channel(0);
        Self {
            inner: Arc::new(PausedInner {
                pending: AtomicUsize::new(0),
                release,
            }),
        }
    }

    /// Mutations currently parked
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until [`resume`](Self::resume) is called, unless `connectivity`
    /// is already online
    ///
    /// The caller is counted as pending before the online check, so a
    /// reconnect racing with this call always sees it.
    pub async fn park(&self, connectivity: &Connectivity) {
        let _pending = {
            self.inner.pending.fetch_add(1, Ordering::SeqCst);
            PendingGuard(&self.inner.pending)
        };
        let mut release = self.inner.release.subscribe();
        release.borrow_and_update();

        if connectivity.is_online() {
            return;
        }
        debug!(pending = self.pending(), "mutation parked until reconnect");
        // The sender lives in `self`, so this cannot close while we wait
        let _ = release.changed().await;
    }

    /// Release every parked mutation; returns how many were waiting
    pub fn resume(&self) -> usize {
        let waiting = self.pending();
        self.inner.release.send_modify(|generation| *generation += 1);
        debug!(waiting, "resumed paused mutations");
        waiting
    }
}

impl Default for PausedMutations {
    fn default() -> Self {
        Self::new()
    }
}
