//! Query keys used across the sync layer

use slate_cache::QueryKey;
use slate_core::{Entity, EntityKind, UserId};

/// Entity collection, e.g. `[tasks]`
#[must_use]
pub fn entities(kind: EntityKind) -> QueryKey {
    QueryKey::new(kind.collection())
}

/// Collection of `E`
#[must_use]
pub fn collection<E: Entity>() -> QueryKey {
    entities(E::KIND)
}

/// Points balance (both counters) of `user`
#[must_use]
pub fn points(user: &UserId) -> QueryKey {
    QueryKey::new("points").with(user)
}

/// Profile row of `user`
#[must_use]
pub fn profile(user: &UserId) -> QueryKey {
    QueryKey::new("profile").with(user)
}

/// Task completion history of `user`
#[must_use]
pub fn completion_history(user: &UserId) -> QueryKey {
    QueryKey::new("task_completion_history").with(user)
}

/// Punishment history of `user`
#[must_use]
pub fn punishment_history(user: &UserId) -> QueryKey {
    QueryKey::new("punishment_history").with(user)
}

/// Rule violations of `user`
#[must_use]
pub fn rule_violations(user: &UserId) -> QueryKey {
    QueryKey::new("rule_violations").with(user)
}

/// Reward redemptions of `user`
#[must_use]
pub fn reward_usage(user: &UserId) -> QueryKey {
    QueryKey::new("reward_usage").with(user)
}

/// Aggregated ledger rows of `user`
#[must_use]
pub fn ledger(user: &UserId) -> QueryKey {
    QueryKey::new("ledger").with(user)
}

/// Wellbeing snapshots of `user`
#[must_use]
pub fn wellbeing(user: &UserId) -> QueryKey {
    QueryKey::new("wellbeing").with(user)
}

/// Keys the sync manager keeps fresh
#[must_use]
pub fn critical(user: &UserId) -> Vec<QueryKey> {
    let mut keys = vec![points(user)];
    keys.extend(EntityKind::all().into_iter().map(entities));
    keys.push(profile(user));
    keys
}
