//! One signed-in user's view of Navy Slate
//!
//! [`SlateClient`] owns the cache, mirror, connectivity state and services
//! for a single user and registers the fetchers behind the critical keys.

use crate::connectivity::{Connectivity, PausedMutations};
use crate::hydrate::{HydrateOutcome, Hydrator};
use crate::keys;
use crate::mutation::MutationRunner;
use crate::notify::{Notifier, TracingNotifier};
use crate::services::{
    MetricsService, PartnerPush, PunishmentService, RewardService, RuleService, ServiceContext,
    TaskService,
};
use crate::sync_manager::{SyncHandle, SyncManager};
use slate_cache::{MirrorStore, PreferenceStore, QueryCache};
use slate_core::{
    resolve_roles, Entity, Profile, Punishment, Reward, Role, Rule, SlateConfig, SlateError,
    SlateResult, Task, UserId,
};
use slate_remote::{
    Backend, ChangeEvent, EdgeFunctionPush, LedgerAccessor, ProfileAccessor, PushDispatcher,
    RemoteAccessor,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// The signed-in user's profile and their partner's
#[derive(Debug, Clone, PartialEq)]
pub struct Partnership {
    /// Profile of the signed-in user
    pub me: Profile,
    /// Linked partner's profile, if any
    pub partner: Option<Profile>,
    /// Effective role after resolving a shared stored role
    pub role: Role,
    /// Partner's effective role
    pub partner_role: Option<Role>,
}

/// Builder for [`SlateClient`]
pub struct SlateClientBuilder {
    user: UserId,
    backend: Arc<dyn Backend>,
    config: SlateConfig,
    mirror: Option<MirrorStore>,
    notifier: Option<Arc<dyn Notifier>>,
    push: Option<Arc<dyn PushDispatcher>>,
    connectivity: Option<Connectivity>,
    prefs: Option<PreferenceStore>,
}

impl SlateClientBuilder {
    /// Timing, cache and mirror settings
    #[must_use]
    pub fn config(mut self, config: SlateConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `mirror` instead of the file mirror from the config
    #[must_use]
    pub fn mirror(mut self, mirror: MirrorStore) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Where user-visible notices go
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use `push` instead of the backend's push edge function
    #[must_use]
    pub fn push(mut self, push: Arc<dyn PushDispatcher>) -> Self {
        self.push = Some(push);
        self
    }

    /// Shared connectivity flag
    #[must_use]
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Local preference store
    #[must_use]
    pub fn prefs(mut self, prefs: PreferenceStore) -> Self {
        self.prefs = Some(prefs);
        self
    }

    /// Wire everything together
    #[must_use]
    pub fn build(self) -> SlateClient {
        let Self {
            user,
            backend,
            config,
            mirror,
            notifier,
            push,
            connectivity,
            prefs,
        } = self;

        let cache = QueryCache::from_config(&config.cache);
        let mirror = mirror.unwrap_or_else(|| MirrorStore::from_config(&config.mirror));
        let notifier = notifier.unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);
        let connectivity = connectivity.unwrap_or_default();
        let paused = PausedMutations::new();
        let prefs = prefs.unwrap_or_else(PreferenceStore::in_memory);
        let dispatcher = push
            .unwrap_or_else(|| Arc::new(EdgeFunctionPush::new(backend.clone())) as Arc<dyn PushDispatcher>);
        let profiles = ProfileAccessor::new(backend.clone());

        let runner = MutationRunner::new(cache.clone(), notifier.clone())
            .with_connectivity(connectivity.clone(), paused.clone())
            .with_mirror(mirror.clone(), user.clone());
        let context = ServiceContext::new(
            runner,
            backend.clone(),
            user.clone(),
            PartnerPush::new(dispatcher, config.notifications.partner_push),
        );

        register_collection::<Task>(&cache, &backend, &mirror, &user);
        register_collection::<Rule>(&cache, &backend, &mirror, &user);
        register_collection::<Reward>(&cache, &backend, &mirror, &user);
        register_collection::<Punishment>(&cache, &backend, &mirror, &user);
        {
            let profiles = profiles.clone();
            let owner = user.clone();
            cache.register_fetcher(&keys::points(&user), move || {
                let profiles = profiles.clone();
                let owner = owner.clone();
                async move { profiles.fetch_balance(&owner).await }
            });
        }
        {
            let profiles = profiles.clone();
            let owner = user.clone();
            cache.register_fetcher(&keys::profile(&user), move || {
                let profiles = profiles.clone();
                let owner = owner.clone();
                async move { profiles.fetch_profile(&owner).await }
            });
        }

        let sync = SyncManager::new(
            cache.clone(),
            config.sync.clone(),
            user.clone(),
            profiles.clone(),
            notifier.clone(),
        )
        .with_connectivity(connectivity.clone(), paused.clone())
        .with_prefs(prefs.clone());

        info!(user = %user, mirror_ttl = ?mirror.ttl(), "client ready");

        SlateClient {
            tasks: TaskService::new(context.clone()),
            rules: RuleService::new(context.clone()),
            rewards: RewardService::new(context.clone()),
            punishments: PunishmentService::new(context.clone()),
            metrics: MetricsService::new(cache.clone(), LedgerAccessor::new(backend.clone()), user.clone()),
            hydrator: Hydrator::new(cache.clone(), mirror.clone(), user.clone(), backend),
            context,
            cache,
            mirror,
            profiles,
            connectivity,
            paused,
            prefs,
            sync,
            config,
            user,
        }
    }
}

fn register_collection<E: Entity>(
    cache: &QueryCache,
    backend: &Arc<dyn Backend>,
    mirror: &MirrorStore,
    user: &UserId,
) {
    let accessor = RemoteAccessor::<E>::new(backend.clone());
    let mirror = mirror.clone();
    let user = user.clone();
    cache.register_fetcher(&keys::collection::<E>(), move || {
        let accessor = accessor.clone();
        let mirror = mirror.clone();
        let user = user.clone();
        async move {
            let items = accessor.list().await?;
            mirror.save(&user, E::KIND.collection(), &items).await;
            Ok::<_, SlateError>(items)
        }
    });
}

/// Cache, services and sync for one user
#[derive(Debug, Clone)]
pub struct SlateClient {
    user: UserId,
    config: SlateConfig,
    cache: QueryCache,
    mirror: MirrorStore,
    profiles: ProfileAccessor,
    connectivity: Connectivity,
    paused: PausedMutations,
    prefs: PreferenceStore,
    context: ServiceContext,
    tasks: TaskService,
    rules: RuleService,
    rewards: RewardService,
    punishments: PunishmentService,
    metrics: MetricsService,
    hydrator: Hydrator,
    sync: SyncManager,
}

impl SlateClient {
    /// Start building a client for `user`
    #[must_use]
    pub fn builder(user: UserId, backend: Arc<dyn Backend>) -> SlateClientBuilder {
        SlateClientBuilder {
            user,
            backend,
            config: SlateConfig::default(),
            mirror: None,
            notifier: None,
            push: None,
            connectivity: None,
            prefs: None,
        }
    }

    /// Signed-in user
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &SlateConfig {
        &self.config
    }

    /// Shared query cache
    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Local mirror
    #[must_use]
    pub fn mirror(&self) -> &MirrorStore {
        &self.mirror
    }

    /// Local preferences
    #[must_use]
    pub fn prefs(&self) -> &PreferenceStore {
        &self.prefs
    }

    /// Connectivity flag driving pauses and reconnect syncs
    #[must_use]
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Mutations parked while offline
    #[must_use]
    pub fn paused(&self) -> &PausedMutations {
        &self.paused
    }

    /// Task operations
    #[must_use]
    pub fn tasks(&self) -> &TaskService {
        &self.tasks
    }

    /// Rule operations
    #[must_use]
    pub fn rules(&self) -> &RuleService {
        &self.rules
    }

    /// Reward operations
    #[must_use]
    pub fn rewards(&self) -> &RewardService {
        &self.rewards
    }

    /// Punishment operations
    #[must_use]
    pub fn punishments(&self) -> &PunishmentService {
        &self.punishments
    }

    /// Ledger summaries and wellbeing charts
    #[must_use]
    pub fn metrics(&self) -> &MetricsService {
        &self.metrics
    }

    /// Background reconciliation
    #[must_use]
    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync
    }

    /// Warm-start every collection from the mirror, then refresh
    pub async fn hydrate(&self) -> Vec<HydrateOutcome> {
        self.hydrator.hydrate_all().await
    }

    /// Current balance (cached, or fetched once)
    ///
    /// # Errors
    /// The backend error when nothing is cached
    pub async fn balance(&self) -> SlateResult<slate_core::PointsBalance> {
        self.context.balance().await
    }

    /// Reload the profile and partner, and point pushes at the partner
    ///
    /// # Errors
    /// The backend error for the user's own profile; a missing partner is
    /// not an error
    pub async fn refresh_profile(&self) -> SlateResult<Partnership> {
        let me: Profile = self.cache.refetch(&keys::profile(&self.user)).await?;
        let partner = self.profiles.fetch_partner(&me).await?;
        let (role, partner_role) = resolve_roles(&me, partner.as_ref());

        self.context
            .push()
            .set_partner(partner.as_ref().map(|partner| partner.id.clone()));
        self.cache.set_data(&keys::points(&self.user), me.balance());

        Ok(Partnership {
            me,
            partner,
            role,
            partner_role,
        })
    }

    /// Start background sync
    #[must_use]
    pub fn start_sync(&self, realtime: Option<broadcast::Receiver<ChangeEvent>>) -> SyncHandle {
        self.sync.start(realtime)
    }

    /// Forget everything held for this user
    ///
    /// Returns the number of mirrored collections removed.
    pub async fn sign_out(&self) -> usize {
        let removed = match self.mirror.clear_for_user(&self.user).await {
            Ok(removed) => removed,
            Err(error) => {
                warn!(user = %self.user, %error, "could not clear mirror");
                0
            }
        };
        self.cache.clear();
        self.context.push().set_partner(None);
        info!(user = %self.user, removed, "signed out");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use slate_core::{RecordId, TaskDraft};
    use slate_remote::{MemoryBackend, Table};
    use std::time::Duration;

    fn client(backend: &Arc<MemoryBackend>) -> SlateClient {
        SlateClient::builder(UserId::new("sub"), backend.clone())
            .mirror(MirrorStore::in_memory(Duration::from_secs(60)))
            .notifier(Arc::new(RecordingNotifier::new()))
            .build()
    }

    #[tokio::test]
    async fn registered_fetchers_mirror_collections() {
        let backend = Arc::new(MemoryBackend::new());
        let task = Task::from_draft(RecordId::new("t1"), &TaskDraft::new("Dishes", 5));
        backend.seed(Table::Tasks, serde_json::to_value(&task).unwrap()).unwrap();
        let client = client(&backend);

        let tasks: Vec<Task> = client.cache().fetch(&keys::collection::<Task>()).await.unwrap();
        assert_eq!(tasks, vec![task]);

        let mirrored: Option<Vec<Task>> = client.mirror().load(client.user(), "tasks").await;
        assert_eq!(mirrored.map(|items| items.len()), Some(1));
    }

    #[tokio::test]
    async fn sign_out_clears_cache_and_mirror() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client(&backend);
        client.hydrate().await;
        assert!(client.cache().contains(&keys::collection::<Task>()));

        client.sign_out().await;

        assert!(client.cache().keys().is_empty());
        let mirrored: Option<Vec<Task>> = client.mirror().load(client.user(), "tasks").await;
        assert!(mirrored.is_none());
    }
}
