//! Error types for coursecredit storage.

use coursecredit_core::LedgerError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("not found")]
    NotFound,

    /// Conditional debit failed: the balance does not cover the amount.
    #[error("insufficient credits: required={required}, available={available}")]
    InsufficientCredits {
        /// Credits requested.
        required: i64,
        /// Credits held when the debit was attempted.
        available: i64,
    },

    /// A credit would push the balance past `i64::MAX`.
    #[error("balance overflow: amount={amount}")]
    BalanceOverflow {
        /// Credits requested.
        amount: i64,
    },

    /// A named lock could not be acquired within its bounded wait.
    #[error("lock timeout: {key}")]
    LockTimeout {
        /// The lock key.
        key: String,
        /// The user the lock belongs to.
        user_id: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits {
                required,
                available,
            } => Self::InsufficientCredits {
                required,
                available,
            },
            StoreError::LockTimeout { user_id, .. } => Self::LockTimeout { user_id },
            StoreError::BalanceOverflow { amount } => Self::InvalidAmount(amount),
            StoreError::NotFound => Self::Storage("record not found".into()),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_keeps_its_numbers() {
        let err: LedgerError = StoreError::InsufficientCredits {
            required: 8,
            available: 2,
        }
        .into();
        assert!(matches!(
            err,
            LedgerError::InsufficientCredits {
                required: 8,
                available: 2
            }
        ));
    }

    #[test]
    fn overflow_is_an_invalid_amount() {
        let err: LedgerError = StoreError::BalanceOverflow { amount: 1 }.into();
        assert!(matches!(err, LedgerError::InvalidAmount(1)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn lock_timeout_is_retryable_upstream() {
        let err: LedgerError = StoreError::LockTimeout {
            key: "monthly_credits:u".into(),
            user_id: "u".into(),
        }
        .into();
        assert!(err.is_retryable());
    }
}
