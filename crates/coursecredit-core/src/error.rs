//! Error types for coursecredit.

use crate::credits::TransactionType;
use crate::ids::IdError;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger, grant, and split operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A debit asked for more credits than the (post-expiration) balance holds.
    #[error("insufficient credits: required={required}, available={available}")]
    InsufficientCredits {
        /// Credits the debit asked for.
        required: i64,
        /// Credits actually available.
        available: i64,
    },

    /// The per-user grant lock could not be acquired in time.
    #[error("timed out waiting for the monthly credit lock of user {user_id}")]
    LockTimeout {
        /// The user whose lock was contended.
        user_id: String,
    },

    /// The catalog referenced a plan it does not know.
    #[error("plan not found: {plan_id}")]
    PlanNotFound {
        /// The missing plan id.
        plan_id: String,
    },

    /// The catalog reported an unusable subscription for the user.
    #[error("subscription not found or invalid for user {user_id}")]
    SubscriptionNotFound {
        /// The user whose subscription could not be resolved.
        user_id: String,
    },

    /// A credit or debit amount was not strictly positive.
    #[error("invalid amount: {0} (must be a positive number of credits)")]
    InvalidAmount(i64),

    /// A split input was not a finite, non-negative currency value.
    #[error("invalid split input: {0}")]
    InvalidSplitInput(String),

    /// The transaction type cannot be used for the requested operation.
    #[error("transaction type {actual:?} cannot be used to {operation}")]
    InvalidTransactionType {
        /// The operation attempted.
        operation: &'static str,
        /// The offending type.
        actual: TransactionType,
    },

    /// A referenced ledger entry does not exist for this user.
    #[error("transaction not found: {transaction_id}")]
    TransactionNotFound {
        /// The transaction id that was not found.
        transaction_id: String,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// The subscription catalog failed.
    #[error("subscription catalog error: {0}")]
    Catalog(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    ///
    /// Lock timeouts and storage hiccups leave no partial state behind;
    /// every other variant fails the same way on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Storage(_))
    }

    /// Credits missing to complete a debit, if this is an insufficient-credits error.
    #[must_use]
    pub const fn shortfall(&self) -> Option<i64> {
        match self {
            Self::InsufficientCredits {
                required,
                available,
            } => Some(*required - *available),
            _ => None,
        }
    }
}
