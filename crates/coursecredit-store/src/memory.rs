//! In-memory storage implementation.
//!
//! All ledger state sits behind one mutex, so every primitive is a single
//! critical section. Grants additionally take a per-user [`KeyedLocks`] entry,
//! which is what keeps their check-then-credit sequence exactly-once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use coursecredit_core::{
    ActivityMarks, Balance, CreditTransaction, SubscriptionPeriod, TransactionDraft,
    TransactionId, TransactionType, UsageAction, UsageCounter, UsageWindow, UserId,
};

use crate::error::{Result, StoreError};
use crate::locks::KeyedLocks;
use crate::{grant_lock_key, GrantOutcome, Store};

type CounterKey = (UserId, DateTime<Utc>, DateTime<Utc>);

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<UserId, Balance>,
    /// Append-only log in commit order.
    transactions: Vec<CreditTransaction>,
    /// Positions in `transactions`, per user, oldest first.
    by_user: HashMap<UserId, Vec<usize>>,
    counters: HashMap<CounterKey, UsageCounter>,
}

impl MemoryState {
    fn append(&mut self, entry: CreditTransaction) -> CreditTransaction {
        let index = self.transactions.len();
        self.by_user.entry(entry.user_id).or_default().push(index);
        self.transactions.push(entry.clone());
        entry
    }

    fn user_entries<'a>(&'a self, user_id: &UserId) -> impl DoubleEndedIterator<Item = &'a CreditTransaction> + 'a {
        self.by_user
            .get(user_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&i| &self.transactions[i])
    }

    fn credit(
        &mut self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let at = draft.created_at;
        let current = self.balances.get(user_id).map_or(0, |b| b.amount);
        let new_amount = current
            .checked_add(amount)
            .ok_or(StoreError::BalanceOverflow { amount })?;

        let balance = self
            .balances
            .entry(*user_id)
            .or_insert_with(|| Balance::new(*user_id, at));
        balance.amount = new_amount;
        balance.updated_at = at;
        balance.version += 1;
        let balance_after = balance.amount;

        Ok(self.append(draft.into_transaction(*user_id, amount, balance_after)))
    }
}

/// Mutex-guarded in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    grant_locks: KeyedLocks,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sum of all ledger entries of a user.
    ///
    /// Always equal to the stored balance; exposed for audits and tests.
    #[must_use]
    pub fn ledger_sum(&self, user_id: &UserId) -> i64 {
        self.state().user_entries(user_id).map(|tx| tx.amount).sum()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_balance_row(&self, user_id: &UserId) -> Result<Option<Balance>> {
        Ok(self.state().balances.get(user_id).cloned())
    }

    async fn apply_credit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        self.state().credit(user_id, amount, draft)
    }

    async fn apply_debit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let mut state = self.state();
        let available = state.balances.get(user_id).map_or(0, |b| b.amount);
        if available < amount {
            return Err(StoreError::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let at = draft.created_at;
        let balance = state.balances.get_mut(user_id).ok_or(StoreError::NotFound)?;
        balance.amount -= amount;
        balance.updated_at = at;
        balance.version += 1;
        let balance_after = balance.amount;

        Ok(state.append(draft.into_transaction(*user_id, -amount, balance_after)))
    }

    async fn expire_balance(
        &self,
        observed: &Balance,
        draft: TransactionDraft,
    ) -> Result<Option<CreditTransaction>> {
        let mut state = self.state();
        let Some(balance) = state.balances.get_mut(&observed.user_id) else {
            return Ok(None);
        };
        if balance.version != observed.version || balance.amount <= 0 {
            return Ok(None);
        }

        let written_off = balance.amount;
        balance.amount = 0;
        balance.updated_at = draft.created_at;
        balance.version += 1;

        let entry = draft.into_transaction(observed.user_id, -written_off, 0);
        Ok(Some(state.append(entry)))
    }

    async fn latest_activity(&self, user_id: &UserId) -> Result<ActivityMarks> {
        let state = self.state();
        let mut marks = ActivityMarks::default();
        for tx in state.user_entries(user_id) {
            let slot = if tx.transaction_type.is_debit() {
                &mut marks.last_debit_at
            } else if tx.transaction_type.is_credit_grant() {
                &mut marks.last_grant_at
            } else {
                continue;
            };
            *slot = (*slot).max(Some(tx.created_at));
        }
        Ok(marks)
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        Ok(self
            .state()
            .transactions
            .iter()
            .find(|tx| tx.id == *transaction_id)
            .cloned())
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        Ok(self
            .state()
            .user_entries(user_id)
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn grant_once(
        &self,
        user_id: &UserId,
        period: &SubscriptionPeriod,
        draft: TransactionDraft,
        lock_timeout: Duration,
    ) -> Result<GrantOutcome> {
        let key = grant_lock_key(user_id);
        let _guard = self
            .grant_locks
            .acquire(&key, lock_timeout)
            .await
            .ok_or_else(|| StoreError::LockTimeout {
                key: key.clone(),
                user_id: user_id.to_string(),
            })?;

        let existing = self
            .state()
            .user_entries(user_id)
            .find(|tx| {
                tx.transaction_type == TransactionType::SubscriptionCredit
                    && period.contains(tx.created_at)
            })
            .map(|tx| tx.id);
        if let Some(id) = existing {
            return Ok(GrantOutcome::AlreadyGranted(id));
        }

        let entry = self
            .state()
            .credit(user_id, period.credits_per_month, draft)?;
        Ok(GrantOutcome::Granted(entry))
    }

    async fn get_usage_counter(
        &self,
        user_id: &UserId,
        window: UsageWindow,
    ) -> Result<UsageCounter> {
        Ok(self
            .state()
            .counters
            .entry((*user_id, window.start, window.end))
            .or_insert_with(|| UsageCounter::new(*user_id, window))
            .clone())
    }

    async fn increment_usage(
        &self,
        user_id: &UserId,
        window: UsageWindow,
        action: UsageAction,
    ) -> Result<UsageCounter> {
        let mut state = self.state();
        let counter = state
            .counters
            .entry((*user_id, window.start, window.end))
            .or_insert_with(|| UsageCounter::new(*user_id, window));
        counter.increment(action);
        Ok(counter.clone())
    }
}
