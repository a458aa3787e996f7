//! Navy Slate Core
//!
//! Domain records and pure rules shared by the cache, remote and sync layers:
//! - Entity records (tasks, rules, rewards, punishments) and the [`Entity`] trait
//! - Profiles, points balances and partner role resolution
//! - Append-only ledger rows and weekly/monthly aggregation
//! - Wellbeing chart series with carry-forward and interpolation
//! - The error taxonomy and runtime configuration
//!
//! # Example
//!
//! ```rust
//! use slate_core::{Currency, PointsBalance, ValidationError};
//!
//! let balance = PointsBalance::new(30, 0);
//! let err = balance.spend(Currency::Points, 50).unwrap_err();
//! assert!(matches!(err, ValidationError::InsufficientPoints { .. }));
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod entity;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod profile;
pub mod wellbeing;

pub use config::{CacheConfig, MirrorConfig, NotificationConfig, SlateConfig, SyncConfig};
pub use entity::{
    DisplayStyle, Entity, EntityKind, Frequency, Points, Priority, Punishment, PunishmentDraft,
    PunishmentPatch, Reward, RewardDraft, RewardPatch, Rule, RuleDraft, RulePatch, Task, TaskDraft,
    TaskPatch, UsageData,
};
pub use error::{RemoteError, RemoteFailureKind, SlateError, SlateResult, ValidationError};
pub use ids::{RecordId, UserId};
pub use ledger::{Ledger, Period, PeriodSummary, PunishmentApplication, RewardUsage, RuleViolation, TaskCompletion};
pub use profile::{resolve_roles, Currency, PointsBalance, Profile, Role};
pub use wellbeing::{chart_series, ChartPoint, FillMode, Series, WellbeingSnapshot};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with slate records
    pub use crate::{
        Entity, EntityKind, PointsBalance, Profile, Punishment, RecordId, Reward, Rule, SlateConfig,
        SlateError, SlateResult, Task, UserId, ValidationError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
