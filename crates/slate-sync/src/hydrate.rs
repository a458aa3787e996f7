//! Warm start from the local mirror
//!
//! A collection found in the mirror is seeded into the cache right away,
//! marked stale, so screens render before the network answers. The server
//! read always follows and replaces both the cache entry and the mirror.

use crate::keys;
use slate_cache::{MirrorStore, QueryCache};
use slate_core::{Entity, EntityKind, Punishment, Reward, Rule, SlateError, SlateResult, Task, UserId};
use slate_remote::{Backend, RemoteAccessor};
use std::sync::Arc;
use tracing::{info, warn};

/// Where the first value of a collection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Seeded from the mirror, then refreshed
    Mirror,
    /// Nothing mirrored; loaded from the server
    Server,
}

/// Result of hydrating one collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydrateOutcome {
    /// Collection hydrated
    pub kind: EntityKind,
    /// Where the cached records came from
    pub source: Source,
    /// Records in the cache afterwards
    pub items: usize,
    /// Whether the server read succeeded
    pub refreshed: bool,
}

/// Loads cached collections for one user
#[derive(Debug, Clone)]
pub struct Hydrator {
    cache: QueryCache,
    mirror: MirrorStore,
    user: UserId,
    backend: Arc<dyn Backend>,
}

impl Hydrator {
    /// Hydrator writing into `cache` and `mirror` for `user`
    #[must_use]
    pub fn new(cache: QueryCache, mirror: MirrorStore, user: UserId, backend: Arc<dyn Backend>) -> Self {
        Self {
            cache,
            mirror,
            user,
            backend,
        }
    }

    /// Hydrate the collection of `E`
    ///
    /// # Errors
    /// The server error, only when the mirror had nothing to show
    pub async fn hydrate<E: Entity>(&self) -> SlateResult<HydrateOutcome> {
        let key = keys::collection::<E>();
        let collection = E::KIND.collection();

        let source = match self.mirror.load::<Vec<E>>(&self.user, collection).await {
            Some(items) => {
                info!(collection, items = items.len(), "warm start from mirror");
                self.cache.seed_data(&key, items);
                Source::Mirror
            }
            None => Source::Server,
        };

        let accessor = RemoteAccessor::<E>::new(self.backend.clone());
        let mirror = self.mirror.clone();
        let user = self.user.clone();
        let fetched = self
            .cache
            .fetch_with(&key, move || async move {
                let items = accessor.list().await?;
                mirror.save(&user, collection, &items).await;
                Ok::<_, SlateError>(items)
            })
            .await;

        match fetched {
            Ok(items) => Ok(HydrateOutcome {
                kind: E::KIND,
                source,
                items: items.len(),
                refreshed: true,
            }),
            Err(error) if source == Source::Mirror => {
                warn!(collection, %error, "refresh failed, keeping mirrored data");
                let items = self.cache.get_data::<Vec<E>>(&key).map_or(0, |items| items.len());
                Ok(HydrateOutcome {
                    kind: E::KIND,
                    source,
                    items,
                    refreshed: false,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Hydrate every entity collection concurrently
    ///
    /// Collections that fail are logged and left out.
    pub async fn hydrate_all(&self) -> Vec<HydrateOutcome> {
        let (tasks, rules, rewards, punishments) = tokio::join!(
            self.hydrate::<Task>(),
            self.hydrate::<Rule>(),
            self.hydrate::<Reward>(),
            self.hydrate::<Punishment>(),
        );

        [tasks, rules, rewards, punishments]
            .into_iter()
            .zip(EntityKind::all())
            .filter_map(|(result, kind)| match result {
                Ok(outcome) => Some(outcome),
                Err(error) => {
                    warn!(%kind, %error, "hydration failed");
                    None
                }
            })
            .collect()
    }
}
