use super::{edit_record, write_back, ServiceContext};
use crate::compensation::WriteChain;
use crate::keys;
use crate::mutation::CollectionMutator;
use chrono::{DateTime, Utc};
use serde_json::json;
use slate_core::{RecordId, Rule, RulePatch, RuleViolation, SlateError, SlateResult, UsageData};
use slate_remote::PushKind;

/// Rules: CRUD plus recording violations
#[derive(Debug, Clone)]
pub struct RuleService {
    context: ServiceContext,
    rules: CollectionMutator<Rule>,
}

impl RuleService {
    /// Service over `context`
    #[must_use]
    pub fn new(context: ServiceContext) -> Self {
        let user = context.user().clone();
        let rules = context.mutator::<Rule>().with_dependent(keys::rule_violations(&user));
        Self { context, rules }
    }

    /// Create, update and delete
    #[must_use]
    pub fn collection(&self) -> &CollectionMutator<Rule> {
        &self.rules
    }

    /// Record that rule `id` was broken now
    ///
    /// # Errors
    /// `ValidationFailed` when the rule is unknown; `RemoteOperationFailed`
    /// after rollback
    pub async fn record_violation(&self, id: &RecordId) -> SlateResult<Rule> {
        self.record_violation_at(id, Utc::now()).await
    }

    /// Record that rule `id` was broken at `at`
    ///
    /// # Errors
    /// Same as [`record_violation`](Self::record_violation)
    pub async fn record_violation_at(&self, id: &RecordId, at: DateTime<Utc>) -> SlateResult<Rule> {
        const LABEL: &str = "record rule violation";
        let context = &self.context;
        let runner = context.runner();

        let rule = match context.find::<Rule>(id) {
            Ok(rule) => rule,
            Err(error) => return runner.reject(LABEL, error),
        };
        let mut usage_data = rule.usage_data;
        usage_data.increment(UsageData::day_index(at.date_naive()));
        let patch = RulePatch {
            usage_data: Some(usage_data),
            ..RulePatch::default()
        };
        let user = context.user();

        let updated = runner
            .run(
                LABEL,
                |ctx| {
                    edit_record::<Rule, _>(ctx, id, |item| item.usage_data = usage_data);
                    ctx.invalidate(keys::rule_violations(user));
                    ctx.invalidate(keys::ledger(user));
                },
                move || async move {
                    let mut chain = WriteChain::new(LABEL);
                    let accessor = self.rules.accessor();
                    let updated = chain.write(accessor.update(id, &patch)).await?;
                    chain.landed("restore rule usage", async move {
                        let restore = RulePatch {
                            usage_data: Some(rule.usage_data),
                            ..RulePatch::default()
                        };
                        accessor.update(id, &restore).await
                    });
                    let violation = RuleViolation::at(id.clone(), user.clone(), at);
                    chain.write(context.ledger().record_violation(&violation)).await?;
                    Ok::<Rule, SlateError>(updated)
                },
                |cache, updated: &Rule| write_back(cache, updated),
            )
            .await?;

        context
            .push()
            .send(
                PushKind::RuleBroken,
                "Rule broken",
                updated.title.clone(),
                json!({ "rule_id": updated.id }),
            )
            .await;
        Ok(updated)
    }
}
