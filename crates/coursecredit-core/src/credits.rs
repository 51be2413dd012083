//! Ledger entry types for coursecredit.
//!
//! Every change to a balance is recorded as an immutable [`CreditTransaction`].
//! Callers describe the change with a [`TransactionDraft`]; the store fills in
//! the signed amount and the resulting balance when it applies the draft.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SubscriptionId, TransactionId, UserId};

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Type of transaction.
    pub transaction_type: TransactionType,

    /// Signed amount in credits. Positive = credit, negative = debit.
    pub amount: i64,

    /// Balance after this entry was applied.
    pub balance_after: i64,

    /// Human-readable description.
    pub description: String,

    /// The payment, video, subscription, or entry this one refers to.
    pub related_entity: Option<RelatedEntity>,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Everything about a ledger entry that is known before it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    /// Type of the entry to write.
    pub transaction_type: TransactionType,
    /// Human-readable description.
    pub description: String,
    /// Optional reference to the entity that caused the entry.
    pub related_entity: Option<RelatedEntity>,
    /// Timestamp to stamp on the entry.
    pub created_at: DateTime<Utc>,
}

impl TransactionDraft {
    /// Create a draft of the given type.
    #[must_use]
    pub fn new(
        transaction_type: TransactionType,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_type,
            description: description.into(),
            related_entity: None,
            created_at,
        }
    }

    /// Attach a related entity.
    #[must_use]
    pub fn with_related(mut self, related: Option<RelatedEntity>) -> Self {
        self.related_entity = related;
        self
    }

    /// Materialize the draft into a ledger entry.
    #[must_use]
    pub fn into_transaction(self, user_id: UserId, amount: i64, balance_after: i64) -> CreditTransaction {
        CreditTransaction {
            id: TransactionId::generate_at(self.created_at),
            user_id,
            transaction_type: self.transaction_type,
            amount,
            balance_after,
            description: self.description,
            related_entity: self.related_entity,
            created_at: self.created_at,
        }
    }
}

/// A reference from a ledger entry to the entity that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    /// Opaque id of the referenced entity.
    pub id: String,
    /// Kind of entity (`payment`, `video`, `subscription`, ...).
    pub kind: String,
}

impl RelatedEntity {
    /// Create a reference to an arbitrary entity.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }

    /// Reference a gateway payment.
    #[must_use]
    pub fn payment(payment_id: impl Into<String>) -> Self {
        Self::new(payment_id, "payment")
    }

    /// Reference a subscription whose allotment was granted.
    #[must_use]
    pub fn subscription(subscription_id: SubscriptionId) -> Self {
        Self::new(subscription_id.to_string(), "subscription")
    }

    /// Reference another ledger entry (e.g. the usage entry a refund reverses).
    #[must_use]
    pub fn transaction(transaction_id: TransactionId) -> Self {
        Self::new(transaction_id.to_string(), "transaction")
    }
}

/// Type of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// User purchased credits.
    Purchase,

    /// Credits spent on a gated action.
    Usage,

    /// A previous usage was reversed.
    Refund,

    /// Promotional credits.
    Bonus,

    /// Monthly subscription allotment.
    SubscriptionCredit,

    /// A stale balance was zeroed.
    Expiration,
}

impl TransactionType {
    /// All variants, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Purchase,
        Self::Usage,
        Self::Refund,
        Self::Bonus,
        Self::SubscriptionCredit,
        Self::Expiration,
    ];

    /// Types that grant new credits and restart the expiration clock.
    pub const CREDIT_GRANTS: [Self; 3] = [Self::Purchase, Self::SubscriptionCredit, Self::Bonus];

    /// Stable snake_case name, as persisted.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Usage => "usage",
            Self::Refund => "refund",
            Self::Bonus => "bonus",
            Self::SubscriptionCredit => "subscription_credit",
            Self::Expiration => "expiration",
        }
    }

    /// Check if this type may be written through `credit`.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(
            self,
            Self::Purchase | Self::Refund | Self::Bonus | Self::SubscriptionCredit
        )
    }

    /// Check if this type grants credits for expiration purposes.
    ///
    /// Refunds are credits but do not count here.
    #[must_use]
    pub const fn is_credit_grant(&self) -> bool {
        matches!(self, Self::Purchase | Self::SubscriptionCredit | Self::Bonus)
    }

    /// Check if this type is a spend.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(self, Self::Usage)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown transaction type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transaction type: {0}")]
pub struct UnknownTransactionType(pub String);

impl FromStr for TransactionType {
    type Err = UnknownTransactionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTransactionType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_materializes_with_amount_and_balance() {
        let user_id = UserId::generate();
        let payment = RelatedEntity::payment("pi_123");
        let tx = TransactionDraft::new(TransactionType::Purchase, "Bought 50 credits", Utc::now())
            .with_related(Some(payment.clone()))
            .into_transaction(user_id, 50, 50);

        assert_eq!(tx.amount, 50);
        assert_eq!(tx.balance_after, 50);
        assert_eq!(tx.transaction_type, TransactionType::Purchase);
        assert_eq!(tx.related_entity, Some(payment));
    }

    #[test]
    fn transaction_type_classes() {
        assert!(TransactionType::Purchase.is_credit_grant());
        assert!(TransactionType::SubscriptionCredit.is_credit_grant());
        assert!(TransactionType::Bonus.is_credit_grant());
        assert!(!TransactionType::Refund.is_credit_grant());
        assert!(!TransactionType::Expiration.is_credit_grant());

        assert!(TransactionType::Refund.is_credit());
        assert!(!TransactionType::Usage.is_credit());
        assert!(!TransactionType::Expiration.is_credit());

        assert!(TransactionType::Usage.is_debit());
        assert!(!TransactionType::Expiration.is_debit());
    }

    #[test]
    fn transaction_type_names_parse_back() {
        for t in TransactionType::ALL {
            assert_eq!(t.as_str().parse::<TransactionType>().unwrap(), t);
            assert_eq!(
                serde_json::to_string(&t).unwrap(),
                format!("\"{}\"", t.as_str())
            );
        }
        assert!("subscriptioncredit".parse::<TransactionType>().is_err());
    }
}
