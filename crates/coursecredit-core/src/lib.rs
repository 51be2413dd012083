//! Core types and pure rules for coursecredit.
//!
//! This crate provides the foundational types of the credit ledger:
//!
//! - **Identifiers**: `UserId`, `SubscriptionId`, `TransactionId`
//! - **Ledger**: `Balance`, `BalanceView`, `CreditTransaction`, `TransactionType`
//! - **Subscriptions**: `Plan`, `PlanLimits`, `ActiveSubscription`, `SubscriptionPeriod`
//! - **Usage**: `UsageAction`, `UsageCounter`, `UsageDecision`
//! - **Expiration**: `ExpirationPolicy`, `ActivityMarks`
//! - **Split**: `calculate_split`, `SplitResult`
//!
//! # Credit Unit
//!
//! Credits are an internal integer currency, unrelated to money. A balance is
//! an `i64` count of credits; sale amounts handled by the split calculator are
//! real money and are converted to integer cents before any arithmetic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod credits;
pub mod error;
pub mod expiration;
pub mod ids;
pub mod split;
pub mod subscription;
pub mod usage;

pub use balance::{Balance, BalanceView};
pub use credits::{
    CreditTransaction, RelatedEntity, TransactionDraft, TransactionType, UnknownTransactionType,
};
pub use error::{LedgerError, Result};
pub use expiration::{ActivityMarks, ExpirationPolicy, ExpirationStatus, DEFAULT_EXPIRATION_MONTHS};
pub use ids::{IdError, SubscriptionId, TransactionId, UserId};
pub use split::{calculate_split, calculate_split_cents, PaymentTransfer, SplitResult};
pub use subscription::{
    calendar_month_bounds, day_bounds, ActiveSubscription, Plan, PlanLimits, SubscriptionPeriod,
    SubscriptionStatus, UsageLimit, FREE_PLAN_COMMISSION_RATE, FREE_PLAN_ID,
    FREE_PLAN_MONTHLY_CREDITS, UNAVAILABLE, UNLIMITED,
};
pub use usage::{decide, LimitScope, UsageAction, UsageCounter, UsageDecision, UsageWindow};
