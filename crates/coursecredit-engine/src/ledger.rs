//! Balance engine: credits, debits, refunds and the balance read path.
//!
//! Every balance read goes through the expiration rule. A balance found stale
//! is written off with one conditional `expiration` entry before the read
//! returns, so callers never see credits that have already lapsed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use coursecredit_core::{
    BalanceView, CreditTransaction, ExpirationPolicy, ExpirationStatus, LedgerError,
    RelatedEntity, Result, TransactionDraft, TransactionId, TransactionType, UserId,
};
use coursecredit_store::Store;

use crate::clock::Clock;
use crate::config::EngineConfig;

/// Re-reads allowed when a concurrent write keeps invalidating an expiration.
const MAX_EXPIRATION_ATTEMPTS: usize = 8;

/// The balance engine.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policy: ExpirationPolicy,
    max_page_size: usize,
}

impl Ledger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            policy: ExpirationPolicy::new(config.expiration_months),
            max_page_size: config.max_page_size.max(1),
        }
    }

    /// The expiration policy in force.
    #[must_use]
    pub const fn policy(&self) -> ExpirationPolicy {
        self.policy
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add `amount` credits to a user's balance.
    ///
    /// Any pending expiration is settled first. Returns the written entry; its
    /// `balance_after` is the new balance.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidAmount` if `amount <= 0`
    /// - `LedgerError::InvalidTransactionType` if `transaction_type` does not add credits
    pub async fn credit(
        &self,
        user_id: &UserId,
        amount: i64,
        description: impl Into<String>,
        related_entity: Option<RelatedEntity>,
        transaction_type: TransactionType,
    ) -> Result<CreditTransaction> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if !transaction_type.is_credit() {
            return Err(LedgerError::InvalidTransactionType {
                operation: "credit",
                actual: transaction_type,
            });
        }

        self.get_balance(user_id).await?;

        let draft = TransactionDraft::new(transaction_type, description, self.clock.now())
            .with_related(related_entity);
        let entry = self.store.apply_credit(user_id, amount, draft).await?;

        info!(
            user_id = %user_id,
            amount,
            kind = %transaction_type,
            balance = entry.balance_after,
            transaction_id = %entry.id,
            "Credits added"
        );
        Ok(entry)
    }

    /// Spend `amount` credits.
    ///
    /// The balance is passed through the expiration rule before the debit.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidAmount` if `amount <= 0`
    /// - `LedgerError::InsufficientCredits` if the balance is too low; nothing is written
    pub async fn debit(
        &self,
        user_id: &UserId,
        amount: i64,
        description: impl Into<String>,
        related_entity: Option<RelatedEntity>,
    ) -> Result<CreditTransaction> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        self.get_balance(user_id).await?;

        let draft = TransactionDraft::new(TransactionType::Usage, description, self.clock.now())
            .with_related(related_entity);
        let entry = match self.store.apply_debit(user_id, amount, draft).await {
            Ok(entry) => entry,
            Err(e) => {
                let err = LedgerError::from(e);
                if let LedgerError::InsufficientCredits { available, .. } = err {
                    warn!(user_id = %user_id, required = amount, available, "Insufficient credits");
                }
                return Err(err);
            }
        };

        info!(
            user_id = %user_id,
            amount,
            balance = entry.balance_after,
            transaction_id = %entry.id,
            "Credits spent"
        );
        Ok(entry)
    }

    /// Return the credits of an earlier `usage` entry as a `refund`.
    ///
    /// Refunding the same entry twice is not prevented here.
    ///
    /// # Errors
    ///
    /// - `LedgerError::TransactionNotFound` if the entry does not exist for this user
    /// - `LedgerError::InvalidTransactionType` if the entry is not a `usage` entry
    pub async fn refund(
        &self,
        user_id: &UserId,
        transaction_id: &TransactionId,
        description: impl Into<String>,
    ) -> Result<CreditTransaction> {
        let original = self
            .store
            .get_transaction(transaction_id)
            .await?
            .filter(|tx| tx.user_id == *user_id)
            .ok_or_else(|| LedgerError::TransactionNotFound {
                transaction_id: transaction_id.to_string(),
            })?;

        if !original.transaction_type.is_debit() {
            return Err(LedgerError::InvalidTransactionType {
                operation: "refund",
                actual: original.transaction_type,
            });
        }

        self.credit(
            user_id,
            original.amount.abs(),
            description,
            Some(RelatedEntity::transaction(original.id)),
            TransactionType::Refund,
        )
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The user's spendable balance.
    ///
    /// Users without a balance row read as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<BalanceView> {
        for _ in 0..MAX_EXPIRATION_ATTEMPTS {
            let Some(row) = self.store.get_balance_row(user_id).await? else {
                return Ok(BalanceView::non_expiring(0));
            };
            let marks = self.store.latest_activity(user_id).await?;
            let now = self.clock.now();

            match self.policy.evaluate(row.amount, marks, now) {
                ExpirationStatus::NeverExpires => return Ok(BalanceView::non_expiring(row.amount)),
                ExpirationStatus::Active {
                    expires_at,
                    expires_in_days,
                } => {
                    return Ok(BalanceView {
                        amount: row.amount,
                        expires_at: Some(expires_at),
                        expires_in_days: Some(expires_in_days),
                    })
                }
                ExpirationStatus::Expired { expired_at } => {
                    let description = format!(
                        "{} credits expired after {} months without activity",
                        row.amount,
                        self.policy.months()
                    );
                    let draft = TransactionDraft::new(TransactionType::Expiration, description, now);

                    if let Some(entry) = self.store.expire_balance(&row, draft).await? {
                        info!(
                            user_id = %user_id,
                            amount = row.amount,
                            expired_at = %expired_at,
                            transaction_id = %entry.id,
                            "Credits expired"
                        );
                        return Ok(BalanceView::non_expiring(0));
                    }
                    debug!(user_id = %user_id, "Balance changed during expiration, re-reading");
                }
            }
        }

        Err(LedgerError::Storage(format!(
            "balance of user {user_id} kept changing during expiration"
        )))
    }

    /// The user's ledger entries, newest first.
    ///
    /// `limit` is capped at the configured page size.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let limit = limit.min(self.max_page_size);
        Ok(self.store.list_transactions(user_id, limit, offset).await?)
    }
}
