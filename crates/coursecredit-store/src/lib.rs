//! Ledger storage for coursecredit.
//!
//! This crate owns the two ledger tables (balance snapshots and the
//! append-only transaction log) and the usage counters. Every mutation is
//! exposed as a single atomic primitive so that callers never perform a
//! read-then-write across two statements.
//!
//! # Backends
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`. Conditional `UPDATE`s and
//!   transaction-scoped advisory locks.
//! - [`MemoryStore`]: a mutex-guarded in-process store for tests and
//!   single-process deployments.
//! - `RocksStore` (feature `rocksdb-backend`): `RocksDB` column families with
//!   CBOR values.
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use coursecredit_core::{TransactionDraft, TransactionType, UserId};
//! use coursecredit_store::{MemoryStore, Store};
//!
//! # async fn demo() -> coursecredit_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//!
//! let draft = TransactionDraft::new(TransactionType::Purchase, "Starter pack", Utc::now());
//! let entry = store.apply_credit(&user_id, 50, draft).await?;
//! assert_eq!(entry.balance_after, 50);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod locks;
pub mod memory;
pub mod postgres;
#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use locks::KeyedLocks;
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use std::time::Duration;

use async_trait::async_trait;
use coursecredit_core::{
    ActivityMarks, Balance, CreditTransaction, SubscriptionPeriod, TransactionDraft,
    TransactionId, UsageAction, UsageCounter, UsageWindow, UserId,
};

/// Outcome of an exactly-once grant attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The grant was written by this call.
    Granted(CreditTransaction),
    /// A grant for the period already exists.
    AlreadyGranted(TransactionId),
}

/// Name of the advisory lock guarding a user's monthly grant.
#[must_use]
pub fn grant_lock_key(user_id: &UserId) -> String {
    format!("monthly_credits:{user_id}")
}

/// The storage trait defining all ledger operations.
///
/// Each method is atomic on its own: either all of its writes commit or none
/// do. Balance rows are provisioned lazily at zero on first credit.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    /// Get the raw balance row of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance_row(&self, user_id: &UserId) -> Result<Option<Balance>>;

    /// Increment the balance by `amount` and append the entry described by `draft`.
    ///
    /// Returns the written entry; its `balance_after` is the new balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn apply_credit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction>;

    /// Decrement the balance by `amount` if it holds at least `amount`, and
    /// append a `-amount` entry.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientCredits` if the balance is too low; nothing is written.
    async fn apply_debit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction>;

    /// Zero the balance and append a `-amount` entry, but only if the row is
    /// still exactly `observed` (same version).
    ///
    /// Returns `None` when the row moved on; the caller should re-read.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn expire_balance(
        &self,
        observed: &Balance,
        draft: TransactionDraft,
    ) -> Result<Option<CreditTransaction>>;

    // =========================================================================
    // Ledger Reads
    // =========================================================================

    /// Latest spend and latest credit-grant timestamps of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn latest_activity(&self, user_id: &UserId) -> Result<ActivityMarks>;

    /// Get a ledger entry by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_transaction(&self, transaction_id: &TransactionId)
        -> Result<Option<CreditTransaction>>;

    /// List entries for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Grants
    // =========================================================================

    /// Under the user's advisory lock, credit `period.credits_per_month` unless
    /// a `subscription_credit` entry already exists inside the period.
    ///
    /// # Errors
    ///
    /// - `StoreError::LockTimeout` if the lock is not acquired within `lock_timeout`;
    ///   nothing is written.
    async fn grant_once(
        &self,
        user_id: &UserId,
        period: &SubscriptionPeriod,
        draft: TransactionDraft,
        lock_timeout: Duration,
    ) -> Result<GrantOutcome>;

    // =========================================================================
    // Usage Counters
    // =========================================================================

    /// Get the counter for a window, creating a zeroed row if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_usage_counter(&self, user_id: &UserId, window: UsageWindow)
        -> Result<UsageCounter>;

    /// Increment one action's count in a window, creating the row if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn increment_usage(
        &self,
        user_id: &UserId,
        window: UsageWindow,
        action: UsageAction,
    ) -> Result<UsageCounter>;
}
