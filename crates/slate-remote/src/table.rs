//! Backend table names

use serde::{Deserialize, Serialize};
use slate_core::EntityKind;
use std::fmt;

/// Tables exposed by the hosted backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// `tasks`
    Tasks,
    /// `rules`
    Rules,
    /// `rewards`
    Rewards,
    /// `punishments`
    Punishments,
    /// `profiles`
    Profiles,
    /// `punishment_history`
    PunishmentHistory,
    /// `task_completion_history`
    TaskCompletionHistory,
    /// `rule_violations`
    RuleViolations,
    /// `reward_usage`
    RewardUsage,
    /// `wellness_reminders`
    WellnessReminders,
    /// `user_push_subscriptions`
    UserPushSubscriptions,
    /// `wellbeing_snapshots`
    WellbeingSnapshots,
}

impl Table {
    /// Every table
    pub const ALL: [Table; 12] = [
        Table::Tasks,
        Table::Rules,
        Table::Rewards,
        Table::Punishments,
        Table::Profiles,
        Table::PunishmentHistory,
        Table::TaskCompletionHistory,
        Table::RuleViolations,
        Table::RewardUsage,
        Table::WellnessReminders,
        Table::UserPushSubscriptions,
        Table::WellbeingSnapshots,
    ];

    /// Name used on the wire
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Tasks => "tasks",
            Table::Rules => "rules",
            Table::Rewards => "rewards",
            Table::Punishments => "punishments",
            Table::Profiles => "profiles",
            Table::PunishmentHistory => "punishment_history",
            Table::TaskCompletionHistory => "task_completion_history",
            Table::RuleViolations => "rule_violations",
            Table::RewardUsage => "reward_usage",
            Table::WellnessReminders => "wellness_reminders",
            Table::UserPushSubscriptions => "user_push_subscriptions",
            Table::WellbeingSnapshots => "wellbeing_snapshots",
        }
    }

    /// Table backing an entity collection
    #[must_use]
    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Task => Table::Tasks,
            EntityKind::Rule => Table::Rules,
            EntityKind::Reward => Table::Rewards,
            EntityKind::Punishment => Table::Punishments,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_tables_match_collections() {
        for kind in EntityKind::all() {
            assert_eq!(Table::for_kind(kind).as_str(), kind.collection());
        }
    }

    #[test]
    fn serde_name_matches_wire_name() {
        for table in Table::ALL {
            let encoded = serde_json::to_value(table).unwrap();
            assert_eq!(encoded, serde_json::Value::String(table.as_str().into()));
        }
    }
}
