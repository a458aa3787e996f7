//! Profiles, points balances and partner roles

use crate::entity::Points;
use crate::error::ValidationError;
use crate::ids::UserId;
use serde::{Deserialize, Serialize};

/// Role a profile plays in a linked partnership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dominant partner
    Dominant,
    /// Submissive partner
    #[default]
    Submissive,
}

impl Role {
    /// The other role
    #[inline]
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Role::Dominant => Role::Submissive,
            Role::Submissive => Role::Dominant,
        }
    }
}

/// Which of the two balances an operation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    /// Regular points
    Points,
    /// Dominant points
    DomPoints,
}

/// The two scalar counters stored on a profile
///
/// The server copy is authoritative; this is only ever replaced whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PointsBalance {
    /// Regular balance
    pub points: Points,
    /// Dominant balance
    pub dom_points: Points,
}

impl PointsBalance {
    /// Balance with both counters set
    #[inline]
    #[must_use]
    pub fn new(points: Points, dom_points: Points) -> Self {
        Self { points, dom_points }
    }

    /// Counter for a currency
    #[inline]
    #[must_use]
    pub fn get(&self, currency: Currency) -> Points {
        match currency {
            Currency::Points => self.points,
            Currency::DomPoints => self.dom_points,
        }
    }

    /// Balance after adding signed deltas to both counters
    #[inline]
    #[must_use]
    pub fn adjusted(self, points: Points, dom_points: Points) -> Self {
        Self {
            points: self.points + points,
            dom_points: self.dom_points + dom_points,
        }
    }

    /// Balance after paying `cost` in `currency`
    ///
    /// # Errors
    /// `ValidationError::InsufficientPoints` when the counter is below `cost`.
    pub fn spend(self, currency: Currency, cost: Points) -> Result<Self, ValidationError> {
        let available = self.get(currency);
        if available < cost {
            return Err(ValidationError::InsufficientPoints {
                required: cost,
                available,
            });
        }
        Ok(match currency {
            Currency::Points => self.adjusted(-cost, 0),
            Currency::DomPoints => self.adjusted(0, -cost),
        })
    }
}

/// User profile row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Owning user
    pub id: UserId,
    /// Name shown to the partner
    pub display_name: Option<String>,
    /// Role in the partnership
    pub role: Role,
    /// Linked partner, if any
    pub linked_partner_id: Option<UserId>,
    /// Regular balance
    pub points: Points,
    /// Dominant balance
    pub dom_points: Points,
}

impl Profile {
    /// Fresh profile with a zero balance
    #[must_use]
    pub fn new(id: UserId, role: Role) -> Self {
        Self {
            id,
            display_name: None,
            role,
            linked_partner_id: None,
            points: 0,
            dom_points: 0,
        }
    }

    /// Balance carried by this profile
    #[inline]
    #[must_use]
    pub fn balance(&self) -> PointsBalance {
        PointsBalance::new(self.points, self.dom_points)
    }
}

/// Effective roles of a linked pair, `(mine, partner's)`
///
/// Distinct stored roles are kept. When both profiles store the same role,
/// the profile whose id sorts first keeps it and the other is assigned the
/// opposite role. Without a partner the stored role is returned unchanged.
#[must_use]
pub fn resolve_roles(me: &Profile, partner: Option<&Profile>) -> (Role, Option<Role>) {
    let Some(partner) = partner else {
        return (me.role, None);
    };
    if me.role != partner.role {
        return (me.role, Some(partner.role));
    }
    if me.id <= partner.id {
        (me.role, Some(me.role.opposite()))
    } else {
        (partner.role.opposite(), Some(partner.role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, role: Role) -> Profile {
        Profile::new(UserId::new(id), role)
    }

    #[test]
    fn spend_rejects_insufficient_balance() {
        let balance = PointsBalance::new(30, 0);
        let err = balance.spend(Currency::Points, 50).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InsufficientPoints {
                required: 50,
                available: 30
            }
        );
    }

    #[test]
    fn spend_deducts_from_selected_currency() {
        let balance = PointsBalance::new(10, 20);
        assert_eq!(
            balance.spend(Currency::DomPoints, 5).unwrap(),
            PointsBalance::new(10, 15)
        );
    }

    #[test]
    fn distinct_roles_are_kept() {
        let me = profile("b", Role::Submissive);
        let partner = profile("a", Role::Dominant);
        assert_eq!(
            resolve_roles(&me, Some(&partner)),
            (Role::Submissive, Some(Role::Dominant))
        );
    }

    #[test]
    fn shared_role_goes_to_smaller_id() {
        let a = profile("a", Role::Dominant);
        let b = profile("b", Role::Dominant);

        assert_eq!(resolve_roles(&a, Some(&b)), (Role::Dominant, Some(Role::Submissive)));
        assert_eq!(resolve_roles(&b, Some(&a)), (Role::Submissive, Some(Role::Dominant)));
    }

    #[test]
    fn no_partner_keeps_role() {
        let me = profile("a", Role::Dominant);
        assert_eq!(resolve_roles(&me, None), (Role::Dominant, None));
    }
}
