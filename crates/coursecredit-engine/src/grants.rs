//! Monthly entitlement grants.
//!
//! A user receives their plan's monthly allotment at most once per billing
//! period, no matter how many requests race to grant it. The check and the
//! credit run under the store's per-user grant lock.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use coursecredit_core::{
    CreditTransaction, LedgerError, RelatedEntity, Result, TransactionDraft, TransactionId,
    TransactionType, UserId,
};
use coursecredit_store::{GrantOutcome as StoredGrant, Store, StoreError};

use crate::catalog::{resolve_entitlement, SubscriptionCatalog};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::ledger::Ledger;

/// Related-entity kind tagged on free tier grants.
pub const FREE_TIER_KIND: &str = "free_tier";

/// Result of [`EntitlementGrantor::ensure_monthly_credits`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum GrantOutcome {
    /// This call wrote the period's grant.
    Granted {
        /// The `subscription_credit` entry.
        transaction: CreditTransaction,
        /// Balance after the grant.
        balance: i64,
    },
    /// The period's grant already exists.
    AlreadyGranted {
        /// The existing entry.
        transaction_id: TransactionId,
    },
    /// The plan grants no credits.
    NothingToGrant,
}

/// Grants monthly plan allotments exactly once per period.
#[derive(Clone)]
pub struct EntitlementGrantor {
    ledger: Ledger,
    store: Arc<dyn Store>,
    catalog: Arc<dyn SubscriptionCatalog>,
    clock: Arc<dyn Clock>,
    free_credits: i64,
    lock_timeout: Duration,
}

impl EntitlementGrantor {
    /// Create a grantor.
    #[must_use]
    pub fn new(
        ledger: Ledger,
        store: Arc<dyn Store>,
        catalog: Arc<dyn SubscriptionCatalog>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            catalog,
            clock,
            free_credits: config.free_tier.credits_per_month,
            lock_timeout: config.grant_lock_timeout,
        }
    }

    /// Make sure the user holds this period's allotment.
    ///
    /// Safe to call on every request: repeated and concurrent calls within a
    /// period produce one grant.
    ///
    /// # Errors
    ///
    /// - `LedgerError::LockTimeout` if the grant lock is contended past the timeout;
    ///   nothing is written and the call may be retried
    /// - `LedgerError::PlanNotFound` / `LedgerError::SubscriptionNotFound` for catalog inconsistencies
    pub async fn ensure_monthly_credits(&self, user_id: &UserId) -> Result<GrantOutcome> {
        let now = self.clock.now();
        let entitlement =
            resolve_entitlement(self.catalog.as_ref(), user_id, now, self.free_credits).await?;
        let period = entitlement.period;

        if period.credits_per_month <= 0 {
            debug!(user_id = %user_id, plan = %entitlement.plan.id, "Plan grants no monthly credits");
            return Ok(GrantOutcome::NothingToGrant);
        }

        // Settle any expiration first so the grant is not written on top of stale credits.
        self.ledger.get_balance(user_id).await?;

        let related = match period.subscription_id {
            Some(subscription_id) => RelatedEntity::subscription(subscription_id),
            None => RelatedEntity::new(period.key(), FREE_TIER_KIND),
        };
        let draft = TransactionDraft::new(
            TransactionType::SubscriptionCredit,
            format!("Monthly credits ({} plan)", entitlement.plan.name),
            now,
        )
        .with_related(Some(related));

        match self
            .store
            .grant_once(user_id, &period, draft, self.lock_timeout)
            .await
        {
            Ok(StoredGrant::Granted(transaction)) => {
                info!(
                    user_id = %user_id,
                    amount = period.credits_per_month,
                    plan = %entitlement.plan.id,
                    balance = transaction.balance_after,
                    transaction_id = %transaction.id,
                    "Monthly credits granted"
                );
                Ok(GrantOutcome::Granted {
                    balance: transaction.balance_after,
                    transaction,
                })
            }
            Ok(StoredGrant::AlreadyGranted(transaction_id)) => {
                debug!(user_id = %user_id, transaction_id = %transaction_id, "Monthly credits already granted");
                Ok(GrantOutcome::AlreadyGranted { transaction_id })
            }
            Err(e @ StoreError::LockTimeout { .. }) => {
                warn!(user_id = %user_id, timeout = ?self.lock_timeout, "Grant lock timed out");
                Err(e.into())
            }
            Err(e) => Err(LedgerError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use coursecredit_core::Plan;
    use coursecredit_store::MemoryStore;

    fn grantor(catalog: StaticCatalog) -> EntitlementGrantor {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap()));
        let config = EngineConfig::default();
        let ledger = Ledger::new(store.clone(), clock.clone(), &config);
        EntitlementGrantor::new(ledger, store, Arc::new(catalog), clock, &config)
    }

    #[tokio::test]
    async fn free_tier_grant_is_tagged() {
        let grantor = grantor(StaticCatalog::new());
        let user_id = UserId::generate();

        let GrantOutcome::Granted { transaction, balance } =
            grantor.ensure_monthly_credits(&user_id).await.unwrap()
        else {
            panic!("expected a grant");
        };

        assert_eq!(balance, 10);
        assert_eq!(transaction.transaction_type, TransactionType::SubscriptionCredit);
        let related = transaction.related_entity.unwrap();
        assert_eq!(related.kind, FREE_TIER_KIND);
        assert!(related.id.starts_with("2024-05-01T00:00:00"));
    }

    #[tokio::test]
    async fn zero_allotment_is_a_no_op() {
        let grantor = grantor(StaticCatalog::new().with_plan(Plan::free(0)));
        let user_id = UserId::generate();

        let outcome = grantor.ensure_monthly_credits(&user_id).await.unwrap();

        assert_eq!(outcome, GrantOutcome::NothingToGrant);
        assert_eq!(grantor.ledger.get_balance(&user_id).await.unwrap().amount, 0);
    }
}
