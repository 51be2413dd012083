//! Credit ledger and subscription entitlement engine for coursecredit.
//!
//! The engine sits between a caller (an API layer, a webhook receiver) and a
//! [`Store`]. It owns the rules: the expiration policy applied on every balance
//! read, exactly-once monthly grants, and plan usage caps.
//!
//! - [`Ledger`]: `credit`, `debit`, `refund`, `get_balance`, `get_transactions`
//! - [`EntitlementGrantor`]: `ensure_monthly_credits`
//! - [`UsageLimiter`]: `can_perform_action`, `increment_usage`
//! - [`calculate_split`]: platform/creator split of a course sale
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use coursecredit_engine::{Engine, EngineConfig, StaticCatalog, SystemClock};
//! use coursecredit_core::UserId;
//! use coursecredit_store::MemoryStore;
//!
//! # async fn demo() -> coursecredit_core::Result<()> {
//! let engine = Engine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(StaticCatalog::new()),
//!     Arc::new(SystemClock),
//!     &EngineConfig::default(),
//! );
//!
//! let user_id = UserId::generate();
//! engine.grantor.ensure_monthly_credits(&user_id).await?;
//! engine.ledger.debit(&user_id, 3, "Video transcription", None).await?;
//! let balance = engine.ledger.get_balance(&user_id).await?;
//! assert_eq!(balance.amount, 7);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod grants;
pub mod ledger;
pub mod limits;

use std::sync::Arc;

pub use backend::open_store;
pub use catalog::{resolve_entitlement, Entitlement, StaticCatalog, SubscriptionCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, FreeTierConfig};
pub use coursecredit_core::{calculate_split, calculate_split_cents, PaymentTransfer, SplitResult};
pub use coursecredit_store::Store;
pub use grants::{EntitlementGrantor, GrantOutcome};
pub use ledger::Ledger;
pub use limits::UsageLimiter;

/// The three engine services wired to one store, catalog and clock.
#[derive(Clone)]
pub struct Engine {
    /// Balance engine.
    pub ledger: Ledger,
    /// Monthly grants.
    pub grantor: EntitlementGrantor,
    /// Usage caps.
    pub limiter: UsageLimiter,
}

impl Engine {
    /// Wire the engine services.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<dyn SubscriptionCatalog>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        let ledger = Ledger::new(Arc::clone(&store), Arc::clone(&clock), config);
        let grantor = EntitlementGrantor::new(
            ledger.clone(),
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&clock),
            config,
        );
        let limiter = UsageLimiter::new(store, catalog, clock, config);

        tracing::debug!(
            expiration_months = config.expiration_months,
            grant_lock_timeout = ?config.grant_lock_timeout,
            free_tier_credits = config.free_tier.credits_per_month,
            "Engine configured"
        );

        Self {
            ledger,
            grantor,
            limiter,
        }
    }
}
