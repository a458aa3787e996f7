use super::{edit_record, write_back, ServiceContext};
use crate::compensation::WriteChain;
use crate::keys;
use crate::mutation::CollectionMutator;
use chrono::Utc;
use serde_json::json;
use slate_core::{
    Currency, PointsBalance, RecordId, Reward, RewardPatch, RewardUsage, SlateError, SlateResult,
    ValidationError,
};
use slate_remote::{AdjustPointsArgs, PushKind};

/// Rewards: CRUD, purchase and redemption
#[derive(Debug, Clone)]
pub struct RewardService {
    context: ServiceContext,
    rewards: CollectionMutator<Reward>,
}

impl RewardService {
    /// Service over `context`
    #[must_use]
    pub fn new(context: ServiceContext) -> Self {
        let rewards = context.mutator::<Reward>();
        Self { context, rewards }
    }

    /// Create, update and delete
    #[must_use]
    pub fn collection(&self) -> &CollectionMutator<Reward> {
        &self.rewards
    }

    /// Buy one unit of reward `id`
    ///
    /// Dominant rewards are paid from the dominant balance.
    ///
    /// # Errors
    /// `ValidationFailed` when the reward is unknown or the balance is below
    /// its cost; `RemoteOperationFailed` after rollback
    pub async fn buy(&self, id: &RecordId) -> SlateResult<Reward> {
        const LABEL: &str = "buy reward";
        let context = &self.context;
        let runner = context.runner();

        let reward = match context.find::<Reward>(id) {
            Ok(reward) => reward,
            Err(error) => return runner.reject(LABEL, error),
        };
        let currency = if reward.is_dom_reward {
            Currency::DomPoints
        } else {
            Currency::Points
        };
        let balance = context.balance().await?;
        if let Err(error) = balance.spend(currency, reward.cost) {
            return runner.reject(LABEL, error);
        }

        let (points, dom_points) = match currency {
            Currency::Points => (-reward.cost, 0),
            Currency::DomPoints => (0, -reward.cost),
        };
        let supply = reward.supply.saturating_add(1);
        let patch = RewardPatch {
            supply: Some(supply),
            ..RewardPatch::default()
        };
        let user = context.user();

        let (updated, _) = runner
            .run(
                LABEL,
                |ctx| {
                    edit_record::<Reward, _>(ctx, id, |item| item.supply = supply);
                    context.credit(ctx, points, dom_points);
                },
                move || async move {
                    // Payment first, so a supply bump never lands unpaid
                    let mut chain = WriteChain::new(LABEL);
                    let profiles = context.profiles();
                    let balance = chain
                        .write(profiles.adjust_points(&AdjustPointsArgs::new(user.clone(), points, dom_points)))
                        .await?;
                    chain.landed("refund payment", async move {
                        let refund =
                            AdjustPointsArgs::new(user.clone(), -points, -dom_points).allowing_negative();
                        profiles.adjust_points(&refund).await
                    });
                    let updated = chain.write(self.rewards.accessor().update(id, &patch)).await?;
                    Ok::<(Reward, PointsBalance), SlateError>((updated, balance))
                },
                |cache, (updated, balance): &(Reward, PointsBalance)| {
                    write_back(cache, updated);
                    context.settle_balance(cache, *balance);
                },
            )
            .await?;

        context
            .push()
            .send(
                PushKind::RewardPurchased,
                "Reward purchased",
                format!("{} ({} points)", updated.title, updated.cost),
                json!({ "reward_id": updated.id, "cost": updated.cost }),
            )
            .await;
        Ok(updated)
    }

    /// Redeem one purchased unit of reward `id`
    ///
    /// # Errors
    /// `ValidationFailed` when the reward is unknown or has no supply;
    /// `RemoteOperationFailed` after rollback
    pub async fn redeem(&self, id: &RecordId) -> SlateResult<Reward> {
        const LABEL: &str = "redeem reward";
        let context = &self.context;
        let runner = context.runner();

        let reward = match context.find::<Reward>(id) {
            Ok(reward) => reward,
            Err(error) => return runner.reject(LABEL, error),
        };
        if reward.supply == 0 {
            return runner.reject(LABEL, ValidationError::OutOfStock { title: reward.title });
        }

        let supply = reward.supply - 1;
        let patch = RewardPatch {
            supply: Some(supply),
            ..RewardPatch::default()
        };
        let user = context.user();

        let updated = runner
            .run(
                LABEL,
                |ctx| {
                    edit_record::<Reward, _>(ctx, id, |item| item.supply = supply);
                    ctx.invalidate(keys::reward_usage(user));
                    ctx.invalidate(keys::ledger(user));
                },
                move || async move {
                    let mut chain = WriteChain::new(LABEL);
                    let accessor = self.rewards.accessor();
                    let updated = chain.write(accessor.update(id, &patch)).await?;
                    chain.landed("restore supply", async move {
                        let restore = RewardPatch {
                            supply: Some(reward.supply),
                            ..RewardPatch::default()
                        };
                        accessor.update(id, &restore).await
                    });
                    chain
                        .write(
                            context
                                .ledger()
                                .record_reward_usage(&RewardUsage::at(id.clone(), user.clone(), Utc::now())),
                        )
                        .await?;
                    Ok::<Reward, SlateError>(updated)
                },
                |cache, updated: &Reward| write_back(cache, updated),
            )
            .await?;

        context
            .push()
            .send(
                PushKind::RewardRedeemed,
                "Reward redeemed",
                updated.title.clone(),
                json!({ "reward_id": updated.id }),
            )
            .await;
        Ok(updated)
    }
}
