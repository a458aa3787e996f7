//! Entity records tracked by the cache
//!
//! Tasks, rules, rewards and punishments share one shape: a server id, a
//! point value, display metadata and usage counters. The [`Entity`] trait is
//! what the generic cache and mutation machinery are parameterized over.

use crate::ids::RecordId;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Points are signed: punishments may drive a balance below zero
pub type Points = i64;

/// Kind of entity collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Tasks that earn points
    Task,
    /// Rules whose violations are recorded
    Rule,
    /// Rewards bought with points
    Reward,
    /// Punishments that deduct points
    Punishment,
}

impl EntityKind {
    /// Backend table and cache collection name
    #[inline]
    #[must_use]
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Rule => "rules",
            EntityKind::Reward => "rewards",
            EntityKind::Punishment => "punishments",
        }
    }

    /// Singular label for messages
    #[inline]
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Rule => "rule",
            EntityKind::Reward => "reward",
            EntityKind::Punishment => "punishment",
        }
    }

    /// All entity kinds
    #[must_use]
    pub fn all() -> [EntityKind; 4] {
        [
            EntityKind::Task,
            EntityKind::Rule,
            EntityKind::Reward,
            EntityKind::Punishment,
        ]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A record held in a cached collection
///
/// `Draft` carries the fields a caller supplies on create; `Patch` carries
/// the optional field set of an update. Both serialize to the JSON rows the
/// backend expects.
pub trait Entity:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Fields supplied on create
    type Draft: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Optional field set applied on update
    type Patch: Clone + Debug + Default + Serialize + Send + Sync + 'static;

    /// Collection this entity lives in
    const KIND: EntityKind;

    /// Record id (server-assigned or placeholder)
    fn id(&self) -> &RecordId;

    /// Build the optimistic record shown before the server answers
    fn from_draft(id: RecordId, draft: &Self::Draft) -> Self;

    /// Apply an update in place
    fn apply_patch(&mut self, patch: &Self::Patch);

    /// Human-readable title used in notices
    fn title(&self) -> &str;
}

/// Priority shown on task and rule cards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority
    Low,
    /// Medium priority
    #[default]
    Medium,
    /// High priority
    High,
}

/// Period over which `frequency_count` completions are allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Quota resets every day
    #[default]
    Daily,
    /// Quota resets every week
    Weekly,
}

/// Display metadata: colors, icon and background image reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayStyle {
    /// Title text color
    pub title_color: String,
    /// Secondary text color
    pub subtext_color: String,
    /// Calendar marker color
    pub calendar_color: String,
    /// Icon tint
    pub icon_color: String,
    /// Built-in icon name
    pub icon_name: Option<String>,
    /// Uploaded icon location
    pub icon_url: Option<String>,
    /// Background image location
    pub background_image_url: Option<String>,
    /// Background opacity in percent (0-100)
    pub background_opacity: u8,
    /// Focal point in percent of width
    pub focal_point_x: u8,
    /// Focal point in percent of height
    pub focal_point_y: u8,
    /// Draw the highlight effect
    pub highlight_effect: bool,
}

impl Default for DisplayStyle {
    fn default() -> Self {
        Self {
            title_color: "#FFFFFF".to_string(),
            subtext_color: "#8E9196".to_string(),
            calendar_color: "#7E69AB".to_string(),
            icon_color: "#9b87f5".to_string(),
            icon_name: None,
            icon_url: None,
            background_image_url: None,
            background_opacity: 100,
            focal_point_x: 50,
            focal_point_y: 50,
            highlight_effect: false,
        }
    }
}

/// Per-weekday usage counters, Monday = 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageData([u32; 7]);

impl UsageData {
    /// Counters from raw values
    #[inline]
    #[must_use]
    pub fn from_days(days: [u32; 7]) -> Self {
        Self(days)
    }

    /// Weekday index (Monday = 0) for a date
    #[inline]
    #[must_use]
    pub fn day_index(date: NaiveDate) -> usize {
        date.weekday().num_days_from_monday() as usize
    }

    /// Count recorded for a weekday
    #[inline]
    #[must_use]
    pub fn get(&self, day: usize) -> u32 {
        self.0.get(day).copied().unwrap_or(0)
    }

    /// Increment the counter for a weekday
    #[inline]
    pub fn increment(&mut self, day: usize) {
        if let Some(slot) = self.0.get_mut(day) {
            *slot = slot.saturating_add(1);
        }
    }

    /// Sum over the whole week
    #[inline]
    #[must_use]
    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    /// Raw counters
    #[inline]
    #[must_use]
    pub fn days(&self) -> [u32; 7] {
        self.0
    }
}

/// Task that earns points when completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Record id
    pub id: RecordId,
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Credited on completion
    pub points: Points,
    /// Sort priority
    pub priority: Priority,
    /// Period the quota applies to
    pub frequency: Frequency,
    /// Completions allowed per period
    pub frequency_count: u32,
    /// Per-weekday usage counts
    pub usage_data: UsageData,
    /// Quota for the current period used up
    pub completed: bool,
    /// Day of the latest completion
    pub last_completed_date: Option<NaiveDate>,
    /// Display metadata
    #[serde(default)]
    pub style: DisplayStyle,
}

impl Task {
    /// Completions already recorded in the current period
    #[must_use]
    pub fn completions_in_period(&self, today: NaiveDate) -> u32 {
        match self.frequency {
            Frequency::Daily => self.usage_data.get(UsageData::day_index(today)),
            Frequency::Weekly => self.usage_data.total(),
        }
    }

    /// Whether another completion is allowed today
    #[must_use]
    pub fn can_complete(&self, today: NaiveDate) -> bool {
        self.completions_in_period(today) < self.frequency_count.max(1)
    }
}

/// Fields supplied when creating a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Credited on completion
    pub points: Points,
    /// Sort priority
    pub priority: Priority,
    /// Period the quota applies to
    pub frequency: Frequency,
    /// Completions allowed per period
    pub frequency_count: u32,
    /// Display metadata
    pub style: DisplayStyle,
}

impl TaskDraft {
    /// Daily task with default styling
    #[must_use]
    pub fn new(title: impl Into<String>, points: Points) -> Self {
        Self {
            title: title.into(),
            description: None,
            points,
            priority: Priority::default(),
            frequency: Frequency::Daily,
            frequency_count: 1,
            style: DisplayStyle::default(),
        }
    }
}

/// Optional field set for task updates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New points value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<Points>,
    /// New priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// New period
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Frequency>,
    /// New quota
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_count: Option<u32>,
    /// New usage counts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_data: Option<UsageData>,
    /// New completion flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    /// New completion day
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_date: Option<NaiveDate>,
    /// New display metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<DisplayStyle>,
}

impl Entity for Task {
    type Draft = TaskDraft;
    type Patch = TaskPatch;
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn from_draft(id: RecordId, draft: &TaskDraft) -> Self {
        Self {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            points: draft.points,
            priority: draft.priority,
            frequency: draft.frequency,
            frequency_count: draft.frequency_count,
            usage_data: UsageData::default(),
            completed: false,
            last_completed_date: None,
            style: draft.style.clone(),
        }
    }

    fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(points) = patch.points {
            self.points = points;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(frequency) = patch.frequency {
            self.frequency = frequency;
        }
        if let Some(count) = patch.frequency_count {
            self.frequency_count = count;
        }
        if let Some(usage) = patch.usage_data {
            self.usage_data = usage;
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if let Some(date) = patch.last_completed_date {
            self.last_completed_date = Some(date);
        }
        if let Some(style) = &patch.style {
            self.style = style.clone();
        }
    }

    fn title(&self) -> &str {
        &self.title
    }
}

/// Rule whose violations are tracked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Record id
    pub id: RecordId,
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Sort priority
    pub priority: Priority,
    /// Period the quota applies to
    pub frequency: Frequency,
    /// Completions allowed per period
    pub frequency_count: u32,
    /// Per-weekday usage counts
    pub usage_data: UsageData,
    /// Display metadata
    #[serde(default)]
    pub style: DisplayStyle,
}

/// Fields supplied when creating a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Sort priority
    pub priority: Priority,
    /// Period the quota applies to
    pub frequency: Frequency,
    /// Completions allowed per period
    pub frequency_count: u32,
    /// Display metadata
    pub style: DisplayStyle,
}

impl RuleDraft {
    /// Daily rule with default styling
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            priority: Priority::default(),
            frequency: Frequency::Daily,
            frequency_count: 1,
            style: DisplayStyle::default(),
        }
    }
}

/// Optional field set for rule updates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// New period
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Frequency>,
    /// New quota
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_count: Option<u32>,
    /// New usage counts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_data: Option<UsageData>,
    /// New display metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<DisplayStyle>,
}

impl Entity for Rule {
    type Draft = RuleDraft;
    type Patch = RulePatch;
    const KIND: EntityKind = EntityKind::Rule;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn from_draft(id: RecordId, draft: &RuleDraft) -> Self {
        Self {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            priority: draft.priority,
            frequency: draft.frequency,
            frequency_count: draft.frequency_count,
            usage_data: UsageData::default(),
            style: draft.style.clone(),
        }
    }

    fn apply_patch(&mut self, patch: &RulePatch) {
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(frequency) = patch.frequency {
            self.frequency = frequency;
        }
        if let Some(count) = patch.frequency_count {
            self.frequency_count = count;
        }
        if let Some(usage) = patch.usage_data {
            self.usage_data = usage;
        }
        if let Some(style) = &patch.style {
            self.style = style.clone();
        }
    }

    fn title(&self) -> &str {
        &self.title
    }
}

/// Reward bought with points and later redeemed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    /// Record id
    pub id: RecordId,
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Price in points
    pub cost: Points,
    /// Number of purchased, not yet redeemed units
    pub supply: u32,
    /// Paid from the dominant balance instead of the regular one
    pub is_dom_reward: bool,
    /// Display metadata
    #[serde(default)]
    pub style: DisplayStyle,
}

/// Fields supplied when creating a reward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardDraft {
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Price in points
    pub cost: Points,
    /// Purchased units
    pub supply: u32,
    /// Paid from the dominant balance
    pub is_dom_reward: bool,
    /// Display metadata
    pub style: DisplayStyle,
}

impl RewardDraft {
    /// Regular reward with no supply
    #[must_use]
    pub fn new(title: impl Into<String>, cost: Points) -> Self {
        Self {
            title: title.into(),
            description: None,
            cost,
            supply: 0,
            is_dom_reward: false,
            style: DisplayStyle::default(),
        }
    }
}

/// Optional field set for reward updates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardPatch {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Points>,
    /// New supply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supply: Option<u32>,
    /// New currency choice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dom_reward: Option<bool>,
    /// New display metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<DisplayStyle>,
}

impl Entity for Reward {
    type Draft = RewardDraft;
    type Patch = RewardPatch;
    const KIND: EntityKind = EntityKind::Reward;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn from_draft(id: RecordId, draft: &RewardDraft) -> Self {
        Self {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            cost: draft.cost,
            supply: draft.supply,
            is_dom_reward: draft.is_dom_reward,
            style: draft.style.clone(),
        }
    }

    fn apply_patch(&mut self, patch: &RewardPatch) {
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(cost) = patch.cost {
            self.cost = cost;
        }
        if let Some(supply) = patch.supply {
            self.supply = supply;
        }
        if let Some(is_dom) = patch.is_dom_reward {
            self.is_dom_reward = is_dom;
        }
        if let Some(style) = &patch.style {
            self.style = style.clone();
        }
    }

    fn title(&self) -> &str {
        &self.title
    }
}

/// Punishment deducting regular points and crediting dominant points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Punishment {
    /// Record id
    pub id: RecordId,
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Deducted from the regular balance
    pub points: Points,
    /// Credited to the dominant balance
    pub dom_points: Points,
    /// Dominant units held
    pub dom_supply: u32,
    /// Display metadata
    #[serde(default)]
    pub style: DisplayStyle,
}

/// Fields supplied when creating a punishment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunishmentDraft {
    /// Display title
    pub title: String,
    /// Optional longer text
    pub description: Option<String>,
    /// Deducted from the regular balance
    pub points: Points,
    /// Credited to the dominant balance
    pub dom_points: Points,
    /// Display metadata
    pub style: DisplayStyle,
}

impl PunishmentDraft {
    /// Punishment crediting half its points (rounded up) to the dominant balance
    #[must_use]
    pub fn new(title: impl Into<String>, points: Points) -> Self {
        Self {
            title: title.into(),
            description: None,
            points,
            dom_points: (points + 1) / 2,
            style: DisplayStyle::default(),
        }
    }
}

/// Optional field set for punishment updates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PunishmentPatch {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New points value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<Points>,
    /// New dominant points value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_points: Option<Points>,
    /// New dominant supply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_supply: Option<u32>,
    /// New display metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<DisplayStyle>,
}

impl Entity for Punishment {
    type Draft = PunishmentDraft;
    type Patch = PunishmentPatch;
    const KIND: EntityKind = EntityKind::Punishment;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn from_draft(id: RecordId, draft: &PunishmentDraft) -> Self {
        Self {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            points: draft.points,
            dom_points: draft.dom_points,
            dom_supply: 0,
            style: draft.style.clone(),
        }
    }

    fn apply_patch(&mut self, patch: &PunishmentPatch) {
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(points) = patch.points {
            self.points = points;
        }
        if let Some(dom_points) = patch.dom_points {
            self.dom_points = dom_points;
        }
        if let Some(dom_supply) = patch.dom_supply {
            self.dom_supply = dom_supply;
        }
        if let Some(style) = &patch.style {
            self.style = style.clone();
        }
    }

    fn title(&self) -> &str {
        &self.title
    }
}

/// Current UTC date, the reference day for usage counters
#[inline]
#[must_use]
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// UTC timestamp helper for ledger rows
#[inline]
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    #[test]
    fn task_from_draft_starts_clean() {
        let id = RecordId::placeholder();
        let task = Task::from_draft(id.clone(), &TaskDraft::new("Dishes", 5));

        assert_eq!(task.id, id);
        assert_eq!(task.points, 5);
        assert_eq!(task.usage_data.total(), 0);
        assert!(!task.completed);
    }

    #[test]
    fn task_patch_only_touches_set_fields() {
        let mut task = Task::from_draft(RecordId::new("t1"), &TaskDraft::new("Dishes", 5));
        task.apply_patch(&TaskPatch {
            points: Some(8),
            ..TaskPatch::default()
        });

        assert_eq!(task.points, 8);
        assert_eq!(task.title, "Dishes");
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = RewardPatch {
            supply: Some(2),
            ..RewardPatch::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "supply": 2 }));
    }

    #[test]
    fn daily_quota_is_per_weekday() {
        let mut task = Task::from_draft(RecordId::new("t1"), &TaskDraft::new("Walk", 2));
        task.frequency_count = 2;

        assert!(task.can_complete(monday()));
        task.usage_data.increment(UsageData::day_index(monday()));
        assert!(task.can_complete(monday()));
        task.usage_data.increment(UsageData::day_index(monday()));
        assert!(!task.can_complete(monday()));

        let tuesday = monday().succ_opt().unwrap();
        assert!(task.can_complete(tuesday));
    }

    #[test]
    fn weekly_quota_counts_whole_week() {
        let mut task = Task::from_draft(RecordId::new("t1"), &TaskDraft::new("Laundry", 3));
        task.frequency = Frequency::Weekly;
        task.frequency_count = 1;
        task.usage_data.increment(0);

        let friday = NaiveDate::from_ymd_opt(2024, 6, 7).unwrap();
        assert!(!task.can_complete(friday));
    }

    #[test]
    fn entity_kind_collections() {
        assert_eq!(EntityKind::Reward.collection(), "rewards");
        assert_eq!(EntityKind::Punishment.label(), "punishment");
        assert_eq!(EntityKind::all().len(), 4);
    }
}
