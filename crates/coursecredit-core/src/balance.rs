//! Balance snapshot and balance read model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// The stored balance snapshot of a user.
///
/// This is the raw row. It can be stale with respect to expiration, so
/// callers outside the ledger read [`BalanceView`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// The owning user.
    pub user_id: UserId,

    /// Credits held. Equals the sum of the user's ledger entries.
    pub amount: i64,

    /// When the row was last written.
    pub updated_at: DateTime<Utc>,

    /// Incremented on every write; used for conditional updates.
    pub version: i64,
}

impl Balance {
    /// A freshly provisioned zero balance.
    #[must_use]
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            amount: 0,
            updated_at: now,
            version: 0,
        }
    }

    /// Check if the balance covers a debit.
    #[must_use]
    pub fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.amount >= amount
    }
}

/// The canonical balance read: stored amount after the expiration rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    /// Spendable credits.
    pub amount: i64,

    /// When the credits expire, if they do.
    pub expires_at: Option<DateTime<Utc>>,

    /// Whole days left until `expires_at` (rounded up).
    pub expires_in_days: Option<i64>,
}

impl BalanceView {
    /// A balance with no expiration date.
    #[must_use]
    pub const fn non_expiring(amount: i64) -> Self {
        Self {
            amount,
            expires_at: None,
            expires_in_days: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_balance_is_zero() {
        let balance = Balance::new(UserId::generate(), Utc::now());
        assert_eq!(balance.amount, 0);
    }

    #[test]
    fn sufficient_credits_is_inclusive() {
        let mut balance = Balance::new(UserId::generate(), Utc::now());
        balance.amount = 10;

        assert!(balance.has_sufficient_credits(8));
        assert!(balance.has_sufficient_credits(10));
        assert!(!balance.has_sufficient_credits(11));
    }
}
