use super::ServiceContext;
use crate::compensation::WriteChain;
use crate::keys;
use crate::mutation::CollectionMutator;
use chrono::Utc;
use serde_json::json;
use slate_core::{
    Entity, PointsBalance, Punishment, PunishmentApplication, RecordId, SlateError, SlateResult,
};
use slate_remote::{AdjustPointsArgs, PushKind};

/// Punishments: CRUD plus applying one
#[derive(Debug, Clone)]
pub struct PunishmentService {
    context: ServiceContext,
    punishments: CollectionMutator<Punishment>,
}

impl PunishmentService {
    /// Service over `context`
    #[must_use]
    pub fn new(context: ServiceContext) -> Self {
        let user = context.user().clone();
        let punishments = context
            .mutator::<Punishment>()
            .with_dependent(keys::punishment_history(&user));
        Self { context, punishments }
    }

    /// Create, update and delete
    #[must_use]
    pub fn collection(&self) -> &CollectionMutator<Punishment> {
        &self.punishments
    }

    /// Apply punishment `id`: deduct its points, credit its dom points
    ///
    /// The regular balance may go negative.
    ///
    /// # Errors
    /// `ValidationFailed` when the punishment is unknown;
    /// `RemoteOperationFailed` after rollback
    pub async fn apply(&self, id: &RecordId) -> SlateResult<PointsBalance> {
        const LABEL: &str = "apply punishment";
        let context = &self.context;
        let runner = context.runner();

        let punishment = match context.find::<Punishment>(id) {
            Ok(punishment) => punishment,
            Err(error) => return runner.reject(LABEL, error),
        };
        let user = context.user();
        let deducted = punishment.points;
        let credited = punishment.dom_points;

        let balance = runner
            .run(
                LABEL,
                |ctx| {
                    context.credit(ctx, -deducted, credited);
                    ctx.invalidate(keys::collection::<Punishment>());
                    ctx.invalidate(keys::punishment_history(user));
                    ctx.invalidate(keys::ledger(user));
                },
                move || async move {
                    let mut chain = WriteChain::new(LABEL);
                    let profiles = context.profiles();
                    let args = AdjustPointsArgs::new(user.clone(), -deducted, credited).allowing_negative();
                    let balance = chain.write(profiles.adjust_points(&args)).await?;
                    chain.landed("reverse adjustment", async move {
                        let reverse = AdjustPointsArgs::new(user.clone(), deducted, -credited).allowing_negative();
                        profiles.adjust_points(&reverse).await
                    });
                    let application = PunishmentApplication::at(id.clone(), user.clone(), deducted, Utc::now());
                    chain.write(context.ledger().record_punishment(&application)).await?;
                    Ok::<PointsBalance, SlateError>(balance)
                },
                |cache, balance: &PointsBalance| context.settle_balance(cache, *balance),
            )
            .await?;

        context
            .push()
            .send(
                PushKind::PunishmentApplied,
                "Punishment applied",
                format!("{} (-{deducted})", punishment.title()),
                json!({ "punishment_id": punishment.id, "points": deducted }),
            )
            .await;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationRunner;
    use crate::services::PartnerPush;
    use crate::notify::RecordingNotifier;
    use pretty_assertions::assert_eq;
    use slate_cache::QueryCache;
    use slate_core::{Profile, PunishmentDraft, RemoteError, Role, UserId};
    use slate_remote::{MemoryBackend, Table};
    use std::sync::Arc;

    fn setup(points: i64) -> (Arc<MemoryBackend>, QueryCache, PunishmentService, UserId) {
        let user = UserId::new("sub");
        let backend = Arc::new(MemoryBackend::new());
        let mut profile = Profile::new(user.clone(), Role::Submissive);
        profile.points = points;
        backend
            .seed(Table::Profiles, serde_json::to_value(&profile).unwrap())
            .unwrap();

        let punishment = Punishment::from_draft(RecordId::new("p1"), &PunishmentDraft::new("Lines", 10));
        let cache = QueryCache::default();
        cache.set_data(&keys::collection::<Punishment>(), vec![punishment]);
        cache.set_data(&keys::points(&user), profile.balance());

        let runner = MutationRunner::new(cache.clone(), Arc::new(RecordingNotifier::new()));
        let context = ServiceContext::new(runner, backend.clone(), user.clone(), PartnerPush::disabled());
        (backend, cache, PunishmentService::new(context), user)
    }

    #[tokio::test]
    async fn punishment_can_overdraw_balance() {
        let (backend, cache, service, user) = setup(4);

        let balance = service.apply(&RecordId::new("p1")).await.unwrap();

        assert_eq!(balance, PointsBalance::new(-6, 5));
        assert_eq!(cache.get_data::<PointsBalance>(&keys::points(&user)).unwrap(), balance);
        assert_eq!(backend.rows(Table::PunishmentHistory).len(), 1);
    }

    #[tokio::test]
    async fn failed_apply_restores_balance() {
        let (backend, cache, service, user) = setup(20);
        backend.fail_next(RemoteError::network("reset"));

        assert!(service.apply(&RecordId::new("p1")).await.is_err());

        assert_eq!(
            cache.get_data::<PointsBalance>(&keys::points(&user)).unwrap(),
            PointsBalance::new(20, 0)
        );
        assert!(backend.rows(Table::PunishmentHistory).is_empty());
    }

    #[tokio::test]
    async fn failed_history_write_reverses_the_deduction() {
        let (backend, _, service, _) = setup(20);
        backend.fail_writes_every(2);

        assert!(service.apply(&RecordId::new("p1")).await.is_err());
        let profile = backend.row(Table::Profiles, "sub").unwrap();
        assert_eq!(profile["points"], 20);
        assert_eq!(profile["dom_points"], 0);
        assert!(backend.rows(Table::PunishmentHistory).is_empty());

        backend.fail_writes_every(0);
        let balance = service.apply(&RecordId::new("p1")).await.unwrap();
        assert_eq!(balance, PointsBalance::new(10, 5));
        assert_eq!(backend.rows(Table::PunishmentHistory).len(), 1);
    }
}
