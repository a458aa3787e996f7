//! Entity services
//!
//! Each service owns the [`CollectionMutator`] of its entity and adds the
//! domain operations that touch more than one key: completing a task moves
//! points, buying a reward spends them, and so on. Preconditions are checked
//! against the cache before anything is written or sent.

mod metrics;
mod partner;
mod punishments;
mod rewards;
mod rules;
mod tasks;

pub use metrics::MetricsService;
pub use partner::PartnerPush;
pub use punishments::PunishmentService;
pub use rewards::RewardService;
pub use rules::RuleService;
pub use tasks::TaskService;

use crate::keys;
use crate::mutation::{CollectionMutator, MutationRunner, OptimisticContext};
use slate_cache::QueryCache;
use slate_core::{
    Entity, PointsBalance, Points, Profile, RecordId, SlateResult, UserId, ValidationError,
};
use slate_remote::{Backend, LedgerAccessor, ProfileAccessor, RemoteAccessor};
use std::sync::Arc;

/// What every service needs for one signed-in user
#[derive(Debug, Clone)]
pub struct ServiceContext {
    runner: MutationRunner,
    backend: Arc<dyn Backend>,
    user: UserId,
    profiles: ProfileAccessor,
    ledger: LedgerAccessor,
    push: PartnerPush,
}

impl ServiceContext {
    /// Shared state of every service for `user`
    #[must_use]
    pub fn new(runner: MutationRunner, backend: Arc<dyn Backend>, user: UserId, push: PartnerPush) -> Self {
        Self {
            profiles: ProfileAccessor::new(backend.clone()),
            ledger: LedgerAccessor::new(backend.clone()),
            runner,
            backend,
            user,
            push,
        }
    }

    /// Mutation runner
    #[must_use]
    pub fn runner(&self) -> &MutationRunner {
        &self.runner
    }

    /// Query cache
    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        self.runner.cache()
    }

    /// Signed-in user
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Partner push
    #[must_use]
    pub fn push(&self) -> &PartnerPush {
        &self.push
    }

    /// Profile and balance RPCs
    #[must_use]
    pub fn profiles(&self) -> &ProfileAccessor {
        &self.profiles
    }

    /// Ledger tables
    #[must_use]
    pub fn ledger(&self) -> &LedgerAccessor {
        &self.ledger
    }

    /// Mutator for the collection of `E`
    #[must_use]
    pub fn mutator<E: Entity>(&self) -> CollectionMutator<E> {
        CollectionMutator::new(self.runner.clone(), RemoteAccessor::new(self.backend.clone()))
    }

    /// Cached record `id` of `E`
    ///
    /// # Errors
    /// `ValidationError::NotFound` when the collection is not loaded or has
    /// no such record
    pub fn find<E: Entity>(&self, id: &RecordId) -> Result<E, ValidationError> {
        self.cache()
            .get_data::<Vec<E>>(&keys::collection::<E>())
            .and_then(|items| items.into_iter().find(|item| item.id() == id))
            .ok_or_else(|| ValidationError::NotFound {
                kind: E::KIND,
                id: id.to_string(),
            })
    }

    /// Current balance, from the cache when present
    ///
    /// # Errors
    /// The profile fetch error when nothing is cached
    pub async fn balance(&self) -> SlateResult<PointsBalance> {
        let key = keys::points(&self.user);
        if let Some(balance) = self.cache().get_data::<PointsBalance>(&key) {
            return Ok(balance);
        }
        let profiles = self.profiles.clone();
        let user = self.user.clone();
        self.cache()
            .fetch_with(&key, move || async move { profiles.fetch_balance(&user).await })
            .await
    }

    /// Optimistically add deltas to the balance and the cached profile
    pub fn credit(&self, ctx: &mut OptimisticContext<'_>, points: Points, dom_points: Points) {
        ctx.edit::<PointsBalance, _>(&keys::points(&self.user), |balance| {
            balance.map(|balance| balance.adjusted(points, dom_points))
        });
        ctx.edit::<Profile, _>(&keys::profile(&self.user), |profile| {
            profile.map(|mut profile| {
                profile.points += points;
                profile.dom_points += dom_points;
                profile
            })
        });
    }

    /// Write the server's balance into both cached copies
    pub fn settle_balance(&self, cache: &QueryCache, balance: PointsBalance) {
        cache.set_data(&keys::points(&self.user), balance);
        cache.update_data::<Profile, _>(&keys::profile(&self.user), |profile| {
            profile.map(|mut profile| {
                profile.points = balance.points;
                profile.dom_points = balance.dom_points;
                profile
            })
        });
    }
}

/// Replace the cached record with the same id as `record`
pub(crate) fn write_back<E: Entity>(cache: &QueryCache, record: &E) {
    cache.update_data::<Vec<E>, _>(&keys::collection::<E>(), |items| {
        items.map(|mut items| {
            if let Some(item) = items.iter_mut().find(|item| item.id() == record.id()) {
                *item = record.clone();
            }
            items
        })
    });
}

/// Apply `edit` to the cached record `id` of `E`
pub(crate) fn edit_record<E, F>(ctx: &mut OptimisticContext<'_>, id: &RecordId, edit: F)
where
    E: Entity,
    F: FnOnce(&mut E),
{
    ctx.edit_record::<E, _>(&keys::collection::<E>(), id, edit);
    ctx.persist::<Vec<E>>(&keys::collection::<E>(), E::KIND.collection());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use slate_core::{Role, Rule, RuleDraft};
    use slate_remote::MemoryBackend;

    fn context() -> (ServiceContext, QueryCache) {
        let cache = QueryCache::default();
        let runner = MutationRunner::new(cache.clone(), Arc::new(RecordingNotifier::new()));
        let backend = Arc::new(MemoryBackend::new());
        let ctx = ServiceContext::new(runner, backend, UserId::new("u1"), PartnerPush::disabled());
        (ctx, cache)
    }

    #[test]
    fn find_reports_missing_records() {
        let (ctx, cache) = context();
        let rule = Rule::from_draft(RecordId::new("r1"), &RuleDraft::new("Bedtime"));
        cache.set_data(&keys::collection::<Rule>(), vec![rule.clone()]);

        assert_eq!(ctx.find::<Rule>(&RecordId::new("r1")).unwrap(), rule);
        assert!(matches!(
            ctx.find::<Rule>(&RecordId::new("r2")),
            Err(ValidationError::NotFound { .. })
        ));
    }

    #[test]
    fn settle_balance_updates_profile_copy() {
        let (ctx, cache) = context();
        cache.set_data(&keys::profile(ctx.user()), Profile::new(ctx.user().clone(), Role::Submissive));

        ctx.settle_balance(&cache, PointsBalance::new(12, 3));

        let profile: Profile = cache.get_data(&keys::profile(ctx.user())).unwrap();
        assert_eq!(profile.balance(), PointsBalance::new(12, 3));
    }
}
