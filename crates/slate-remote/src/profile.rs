//! Profile and points balance accessor

use crate::accessor::{decode_row, encode_row};
use crate::backend::{Backend, Filter};
use crate::memory::ADJUST_POINTS_RPC;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use slate_core::error::codes;
use slate_core::{Points, PointsBalance, Profile, RemoteError, SlateResult, UserId};
use std::sync::Arc;
use tracing::debug;

/// Arguments of the balance-adjusting RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustPointsArgs {
    /// Whose balance to adjust
    pub user_id: UserId,
    /// Change to the regular balance
    pub points_delta: Points,
    /// Change to the dominant balance
    pub dom_points_delta: Points,
    /// Permit the balance to drop below zero (punishments)
    #[serde(default)]
    pub allow_negative: bool,
}

impl AdjustPointsArgs {
    /// Spend or earn regular and dominant points; overdraw is rejected
    #[must_use]
    pub fn new(user_id: UserId, points_delta: Points, dom_points_delta: Points) -> Self {
        Self {
            user_id,
            points_delta,
            dom_points_delta,
            allow_negative: false,
        }
    }

    /// Allow the result to go negative
    #[must_use]
    pub fn allowing_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }
}

/// Reads profiles and adjusts the authoritative balance
#[derive(Debug, Clone)]
pub struct ProfileAccessor {
    backend: Arc<dyn Backend>,
}

impl ProfileAccessor {
    /// Accessor over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Profile of `user`
    ///
    /// # Errors
    /// `RemoteOperationFailed` when missing or on backend failure
    pub async fn fetch_profile(&self, user: &UserId) -> SlateResult<Profile> {
        let filter = Filter::all().eq("id", user.as_str()).limit(1);
        let row = self
            .backend
            .select(Table::Profiles, &filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::new(codes::NO_ROWS, format!("no profile for {user}")))?;
        Ok(decode_row(Table::Profiles, row)?)
    }

    /// Linked partner of `profile`, if any
    ///
    /// # Errors
    /// `RemoteOperationFailed` on backend failure; a dangling link is `None`
    pub async fn fetch_partner(&self, profile: &Profile) -> SlateResult<Option<Profile>> {
        let Some(partner) = &profile.linked_partner_id else {
            return Ok(None);
        };
        match self.fetch_profile(partner).await {
            Ok(found) => Ok(Some(found)),
            Err(slate_core::SlateError::RemoteOperationFailed(e))
                if e.code.as_deref() == Some(codes::NO_ROWS) =>
            {
                debug!(%partner, "linked partner has no profile");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Current balance of `user`
    ///
    /// # Errors
    /// Same as [`fetch_profile`](Self::fetch_profile)
    pub async fn fetch_balance(&self, user: &UserId) -> SlateResult<PointsBalance> {
        Ok(self.fetch_profile(user).await?.balance())
    }

    /// Apply deltas server-side and return the new balance
    ///
    /// # Errors
    /// `RemoteOperationFailed` with a constraint code on overdraw
    pub async fn adjust_points(&self, args: &AdjustPointsArgs) -> SlateResult<PointsBalance> {
        debug!(user = %args.user_id, points = args.points_delta, dom_points = args.dom_points_delta, "adjust points");
        let body = encode_row(Table::Profiles, args)?;
        let balance = self.backend.rpc(ADJUST_POINTS_RPC, body).await?;
        Ok(decode_row(Table::Profiles, balance)?)
    }

    /// Insert or replace a profile
    ///
    /// # Errors
    /// `RemoteOperationFailed` on backend failure
    pub async fn save_profile(&self, profile: &Profile) -> SlateResult<Profile> {
        let row = encode_row(Table::Profiles, profile)?;
        let stored = self.backend.upsert(Table::Profiles, row).await?;
        Ok(decode_row(Table::Profiles, stored)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use slate_core::{Role, SlateError};

    async fn setup(points: Points) -> (ProfileAccessor, UserId) {
        let backend = Arc::new(MemoryBackend::new());
        let accessor = ProfileAccessor::new(backend);
        let mut profile = Profile::new(UserId::new("sub"), Role::Submissive);
        profile.points = points;
        accessor.save_profile(&profile).await.unwrap();
        (accessor, profile.id)
    }

    #[tokio::test]
    async fn adjust_points_returns_new_balance() {
        let (accessor, user) = setup(10).await;
        let balance = accessor
            .adjust_points(&AdjustPointsArgs::new(user.clone(), 5, 1))
            .await
            .unwrap();

        assert_eq!(balance, PointsBalance::new(15, 1));
        assert_eq!(accessor.fetch_balance(&user).await.unwrap(), balance);
    }

    #[tokio::test]
    async fn overdraw_is_constraint_violation() {
        let (accessor, user) = setup(30).await;
        let err = accessor
            .adjust_points(&AdjustPointsArgs::new(user, -50, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SlateError::RemoteOperationFailed(ref e) if e.code.as_deref() == Some(codes::CHECK_VIOLATION)));
    }

    #[tokio::test]
    async fn dangling_partner_link_is_none() {
        let (accessor, user) = setup(0).await;
        let mut me = accessor.fetch_profile(&user).await.unwrap();
        me.linked_partner_id = Some(UserId::new("ghost"));
        assert!(accessor.fetch_partner(&me).await.unwrap().is_none());
    }
}
