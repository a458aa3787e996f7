//! Append-only ledger of applied effects
//!
//! Completion, violation, usage and punishment rows are only ever used for
//! weekly and monthly aggregation. They are never replayed to rebuild a
//! balance; the profile's stored counters are authoritative.

use crate::entity::{Points, UsageData};
use crate::ids::{RecordId, UserId};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// ISO week identifier, e.g. `2024-W23`
#[must_use]
pub fn week_identifier(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Monday of the ISO week containing `date`
#[must_use]
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Row appended when a task is completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    /// Server id; `None` before insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Completed task
    pub task_id: RecordId,
    /// Owning user
    pub user_id: UserId,
    /// Points credited
    pub points: Points,
    /// Completion time
    pub completed_at: DateTime<Utc>,
}

/// Row appended when a punishment is applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunishmentApplication {
    /// Server id; `None` before insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Applied punishment
    pub punishment_id: RecordId,
    /// Owning user
    pub user_id: UserId,
    /// Points taken
    pub points_deducted: Points,
    /// Weekday, Monday = 0
    pub day_of_week: u8,
    /// Application time
    pub applied_at: DateTime<Utc>,
}

/// Row appended when a rule is broken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleViolation {
    /// Server id; `None` before insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Broken rule
    pub rule_id: RecordId,
    /// Owning user
    pub user_id: UserId,
    /// Weekday, Monday = 0
    pub day_of_week: u8,
    /// ISO week, `YYYY-Www`
    pub week_number: String,
    /// Violation time
    pub violated_at: DateTime<Utc>,
}

/// Row appended when a reward is redeemed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardUsage {
    /// Server id; `None` before insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Redeemed reward
    pub reward_id: RecordId,
    /// Owning user
    pub user_id: UserId,
    /// Weekday, Monday = 0
    pub day_of_week: u8,
    /// ISO week, `YYYY-Www`
    pub week_number: String,
    /// Redemption time
    pub used_at: DateTime<Utc>,
}

impl TaskCompletion {
    /// Completion row stamped now
    #[must_use]
    pub fn now(task_id: RecordId, user_id: UserId, points: Points) -> Self {
        Self {
            id: None,
            task_id,
            user_id,
            points,
            completed_at: Utc::now(),
        }
    }
}

impl PunishmentApplication {
    /// Application row stamped at `at`
    #[must_use]
    pub fn at(punishment_id: RecordId, user_id: UserId, points_deducted: Points, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            punishment_id,
            user_id,
            points_deducted,
            day_of_week: day_of_week(at.date_naive()),
            applied_at: at,
        }
    }
}

impl RuleViolation {
    /// Violation row stamped at `at`
    #[must_use]
    pub fn at(rule_id: RecordId, user_id: UserId, at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        Self {
            id: None,
            rule_id,
            user_id,
            day_of_week: day_of_week(date),
            week_number: week_identifier(date),
            violated_at: at,
        }
    }
}

impl RewardUsage {
    /// Usage row stamped at `at`
    #[must_use]
    pub fn at(reward_id: RecordId, user_id: UserId, at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        Self {
            id: None,
            reward_id,
            user_id,
            day_of_week: day_of_week(date),
            week_number: week_identifier(date),
            used_at: at,
        }
    }
}

fn day_of_week(date: NaiveDate) -> u8 {
    // Monday = 0, matching UsageData
    u8::try_from(UsageData::day_index(date)).unwrap_or(0)
}

/// Aggregation window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// ISO week containing the date
    Week(NaiveDate),
    /// Calendar month
    Month { year: i32, month: u32 },
}

impl Period {
    /// Whether a date falls inside this window
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        match *self {
            Period::Week(anchor) => week_start(anchor) == week_start(date),
            Period::Month { year, month } => date.year() == year && date.month() == month,
        }
    }
}

/// Counters for one aggregation window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeriodSummary {
    /// Task completions in the window
    pub tasks_completed: u32,
    /// Rule violations in the window
    pub rules_broken: u32,
    /// Reward redemptions in the window
    pub rewards_redeemed: u32,
    /// Punishments in the window
    pub punishments_applied: u32,
    /// Points credited by completions
    pub points_earned: Points,
    /// Points deducted by punishments
    pub points_lost: Points,
}

/// Ledger rows used for aggregation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// Task completions
    pub completions: Vec<TaskCompletion>,
    /// Punishment applications
    pub punishments: Vec<PunishmentApplication>,
    /// Rule violations
    pub violations: Vec<RuleViolation>,
    /// Reward redemptions
    pub reward_usage: Vec<RewardUsage>,
}

impl Ledger {
    /// Fold every row inside `period` into one summary
    #[must_use]
    pub fn summarize(&self, period: Period) -> PeriodSummary {
        let mut summary = PeriodSummary::default();

        for row in self.completions.iter().filter(|r| period.contains(r.completed_at.date_naive())) {
            summary.tasks_completed += 1;
            summary.points_earned += row.points;
        }
        for row in self.punishments.iter().filter(|r| period.contains(r.applied_at.date_naive())) {
            summary.punishments_applied += 1;
            summary.points_lost += row.points_deducted;
        }
        summary.rules_broken = count(self.violations.iter().map(|r| r.violated_at), period);
        summary.rewards_redeemed = count(self.reward_usage.iter().map(|r| r.used_at), period);

        summary
    }

    /// One summary per weekday (Monday first) of the week containing `anchor`
    #[must_use]
    pub fn daily_breakdown(&self, anchor: NaiveDate) -> [PeriodSummary; 7] {
        let start = week_start(anchor);
        let mut days = [PeriodSummary::default(); 7];

        for (offset, slot) in days.iter_mut().enumerate() {
            let day = start + Duration::days(offset as i64);
            let in_day = |at: DateTime<Utc>| at.date_naive() == day;

            for row in self.completions.iter().filter(|r| in_day(r.completed_at)) {
                slot.tasks_completed += 1;
                slot.points_earned += row.points;
            }
            for row in self.punishments.iter().filter(|r| in_day(r.applied_at)) {
                slot.punishments_applied += 1;
                slot.points_lost += row.points_deducted;
            }
            slot.rules_broken = self.violations.iter().filter(|r| in_day(r.violated_at)).count() as u32;
            slot.rewards_redeemed = self.reward_usage.iter().filter(|r| in_day(r.used_at)).count() as u32;
        }

        days
    }
}

fn count(stamps: impl Iterator<Item = DateTime<Utc>>, period: Period) -> u32 {
    stamps.filter(|at| period.contains(at.date_naive())).count() as u32
}
