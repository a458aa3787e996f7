//! Append-only history tables

use crate::accessor::{decode_row, encode_row};
use crate::backend::{Backend, Filter, RemoteResult};
use crate::table::Table;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slate_core::{
    Ledger, PunishmentApplication, RewardUsage, RuleViolation, SlateResult, TaskCompletion, UserId,
    WellbeingSnapshot,
};
use std::sync::Arc;

/// Appends and lists ledger rows
#[derive(Debug, Clone)]
pub struct LedgerAccessor {
    backend: Arc<dyn Backend>,
}

impl LedgerAccessor {
    /// Accessor over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    async fn append<T: Serialize + DeserializeOwned>(&self, table: Table, row: &T) -> SlateResult<T> {
        let stored = self.backend.insert(table, encode_row(table, row)?).await?;
        Ok(decode_row(table, stored)?)
    }

    async fn list<T: DeserializeOwned>(&self, table: Table, user: &UserId, order: &str) -> SlateResult<Vec<T>> {
        let filter = Filter::all().eq("user_id", user.as_str()).order_desc(order);
        let rows = self.backend.select(table, &filter).await?;
        Ok(rows
            .into_iter()
            .map(|row| decode_row(table, row))
            .collect::<RemoteResult<Vec<T>>>()?)
    }

    /// # Errors
    /// `RemoteOperationFailed` on backend failure
    pub async fn record_completion(&self, row: &TaskCompletion) -> SlateResult<TaskCompletion> {
        self.append(Table::TaskCompletionHistory, row).await
    }

    /// # Errors
    /// `RemoteOperationFailed` on backend failure
    pub async fn record_punishment(&self, row: &PunishmentApplication) -> SlateResult<PunishmentApplication> {
        self.append(Table::PunishmentHistory, row).await
    }

    /// # Errors
    /// `RemoteOperationFailed` on backend failure
    pub async fn record_violation(&self, row: &RuleViolation) -> SlateResult<RuleViolation> {
        self.append(Table::RuleViolations, row).await
    }

    /// # Errors
    /// `RemoteOperationFailed` on backend failure
    pub async fn record_reward_usage(&self, row: &RewardUsage) -> SlateResult<RewardUsage> {
        self.append(Table::RewardUsage, row).await
    }

    /// # Errors
    /// `RemoteOperationFailed` on backend failure
    pub async fn record_wellbeing(&self, row: &WellbeingSnapshot) -> SlateResult<WellbeingSnapshot> {
        self.append(Table::WellbeingSnapshots, row).await
    }

    /// Wellbeing snapshots of `user`, newest first
    ///
    /// # Errors
    /// `RemoteOperationFailed` on backend failure
    pub async fn wellbeing_snapshots(&self, user: &UserId) -> SlateResult<Vec<WellbeingSnapshot>> {
        self.list(Table::WellbeingSnapshots, user, "created_at").await
    }

    /// Every ledger row of `user`, newest first per table
    ///
    /// # Errors
    /// `RemoteOperationFailed` if any of the four reads fails
    pub async fn load_ledger(&self, user: &UserId) -> SlateResult<Ledger> {
        let (completions, punishments, violations, reward_usage) = tokio::try_join!(
            self.list(Table::TaskCompletionHistory, user, "completed_at"),
            self.list(Table::PunishmentHistory, user, "applied_at"),
            self.list(Table::RuleViolations, user, "violated_at"),
            self.list(Table::RewardUsage, user, "used_at"),
        )?;
        Ok(Ledger {
            completions,
            punishments,
            violations,
            reward_usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use chrono::{Duration, Utc};
    use slate_core::{Period, RecordId};

    #[tokio::test]
    async fn appended_rows_feed_the_summary() {
        let ledger = LedgerAccessor::new(Arc::new(MemoryBackend::new()));
        let user = UserId::new("sub");
        let now = Utc::now();

        ledger
            .record_completion(&TaskCompletion::now(RecordId::new("t1"), user.clone(), 5))
            .await
            .unwrap();
        ledger
            .record_punishment(&PunishmentApplication::at(RecordId::new("p1"), user.clone(), 3, now))
            .await
            .unwrap();
        ledger
            .record_violation(&RuleViolation::at(RecordId::new("r1"), UserId::new("other"), now))
            .await
            .unwrap();

        let rows = ledger.load_ledger(&user).await.unwrap();
        let summary = rows.summarize(Period::Week(now.date_naive()));

        assert_eq!(summary.tasks_completed, 1);
        assert_eq!(summary.points_earned, 5);
        assert_eq!(summary.points_lost, 3);
        assert_eq!(summary.rules_broken, 0);
        assert!(rows.completions[0].id.is_some());
    }

    #[tokio::test]
    async fn wellbeing_is_newest_first() {
        let ledger = LedgerAccessor::new(Arc::new(MemoryBackend::new()));
        let user = UserId::new("sub");
        for days_ago in [3, 1, 2] {
            let snapshot = WellbeingSnapshot {
                id: None,
                user_id: user.clone(),
                metrics: Default::default(),
                overall_score: f64::from(days_ago),
                created_at: Utc::now() - Duration::days(i64::from(days_ago)),
            };
            ledger.record_wellbeing(&snapshot).await.unwrap();
        }

        let scores: Vec<f64> = ledger
            .wellbeing_snapshots(&user)
            .await
            .unwrap()
            .iter()
            .map(|s| s.overall_score)
            .collect();
        assert_eq!(scores, vec![1.0, 2.0, 3.0]);
    }
}
