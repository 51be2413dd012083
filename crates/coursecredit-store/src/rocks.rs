//! `RocksDB` storage implementation.
//!
//! `RocksDB` has no conditional writes, so each primitive holds a per-user
//! stripe lock across its read-check-write and commits through one
//! `WriteBatch`. This makes the backend safe within one process only.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use coursecredit_core::{
    ActivityMarks, Balance, CreditTransaction, SubscriptionPeriod, TransactionDraft,
    TransactionId, TransactionType, UsageAction, UsageCounter, UsageWindow, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::locks::KeyedLocks;
use crate::schema::{all_column_families, cf};
use crate::{grant_lock_key, GrantOutcome, Store};

const LOCK_STRIPES: usize = 64;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    stripes: Vec<Mutex<()>>,
    grant_locks: KeyedLocks,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            grant_locks: KeyedLocks::new(),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Lock the stripe owning a user's rows.
    fn lock_user(&self, user_id: &UserId) -> MutexGuard<'_, ()> {
        let stripe = usize::from(user_id.as_bytes()[15]) % self.stripes.len();
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn read_balance(&self, user_id: &UserId) -> Result<Option<Balance>> {
        let cf = self.cf(cf::BALANCES)?;
        self.db
            .get_cf(&cf, keys::balance_key(user_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn read_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>> {
        let cf = self.cf(cf::TRANSACTIONS)?;
        self.db
            .get_cf(&cf, keys::transaction_key(transaction_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Entry IDs of a user, newest first.
    fn user_transaction_ids(&self, user_id: &UserId) -> Result<Vec<TransactionId>> {
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let prefix = keys::user_transactions_prefix(user_id);
        let upper = keys::user_transactions_upper(user_id);

        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&upper, Direction::Reverse))
        {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(id) = keys::extract_transaction_id_from_user_key(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Write the new balance row and its ledger entry in one batch.
    fn commit(&self, balance: &Balance, entry: &CreditTransaction) -> Result<()> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_balances, keys::balance_key(&balance.user_id), Self::serialize(balance)?);
        batch.put_cf(&cf_tx, keys::transaction_key(&entry.id), Self::serialize(entry)?);
        batch.put_cf(&cf_by_user, keys::user_transaction_key(&entry.user_id, &entry.id), []);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn credit_locked(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let mut balance = self
            .read_balance(user_id)?
            .unwrap_or_else(|| Balance::new(*user_id, draft.created_at));
        balance.amount = balance
            .amount
            .checked_add(amount)
            .ok_or(StoreError::BalanceOverflow { amount })?;
        balance.updated_at = draft.created_at;
        balance.version += 1;

        let entry = draft.into_transaction(*user_id, amount, balance.amount);
        self.commit(&balance, &entry)?;
        Ok(entry)
    }

    fn debit_locked(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let Some(mut balance) = self.read_balance(user_id)? else {
            return Err(StoreError::InsufficientCredits {
                required: amount,
                available: 0,
            });
        };
        if !balance.has_sufficient_credits(amount) {
            return Err(StoreError::InsufficientCredits {
                required: amount,
                available: balance.amount,
            });
        }

        balance.amount -= amount;
        balance.updated_at = draft.created_at;
        balance.version += 1;

        let entry = draft.into_transaction(*user_id, -amount, balance.amount);
        self.commit(&balance, &entry)?;
        Ok(entry)
    }

    fn expire_locked(
        &self,
        observed: &Balance,
        draft: TransactionDraft,
    ) -> Result<Option<CreditTransaction>> {
        let Some(mut balance) = self.read_balance(&observed.user_id)? else {
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
        self.commit(&balance, &entry)?;
        Ok(Some(entry))
    }

    fn find_grant(&self, user_id: &UserId, period: &SubscriptionPeriod) -> Result<Option<TransactionId>> {
        for id in self.user_transaction_ids(user_id)? {
            let Some(tx) = self.read_transaction(&id)? else {
                continue;
            };
            if tx.transaction_type == TransactionType::SubscriptionCredit
                && period.contains(tx.created_at)
            {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn read_counter(&self, user_id: &UserId, window: UsageWindow) -> Result<Option<UsageCounter>> {
        let cf = self.cf(cf::USAGE_COUNTERS)?;
        self.db
            .get_cf(&cf, keys::usage_counter_key(user_id, window))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn write_counter(&self, counter: &UsageCounter) -> Result<()> {
        let cf = self.cf(cf::USAGE_COUNTERS)?;
        let key = keys::usage_counter_key(&counter.user_id, counter.window());
        self.db
            .put_cf(&cf, key, Self::serialize(counter)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    async fn get_balance_row(&self, user_id: &UserId) -> Result<Option<Balance>> {
        self.read_balance(user_id)
    }

    async fn apply_credit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let _lock = self.lock_user(user_id);
        self.credit_locked(user_id, amount, draft)
    }

    async fn apply_debit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let _lock = self.lock_user(user_id);
        self.debit_locked(user_id, amount, draft)
    }

    async fn expire_balance(
        &self,
        observed: &Balance,
        draft: TransactionDraft,
    ) -> Result<Option<CreditTransaction>> {
        let _lock = self.lock_user(&observed.user_id);
        self.expire_locked(observed, draft)
    }

    // =========================================================================
    // Ledger Reads
    // =========================================================================

    async fn latest_activity(&self, user_id: &UserId) -> Result<ActivityMarks> {
        let mut marks = ActivityMarks::default();
        for id in self.user_transaction_ids(user_id)? {
            let Some(tx) = self.read_transaction(&id)? else {
                continue;
            };
            if tx.transaction_type.is_debit() {
                marks.last_debit_at = marks.last_debit_at.max(Some(tx.created_at));
            } else if tx.transaction_type.is_credit_grant() {
                marks.last_grant_at = marks.last_grant_at.max(Some(tx.created_at));
            }
        }
        Ok(marks)
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        self.read_transaction(transaction_id)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let mut transactions = Vec::new();
        for id in self
            .user_transaction_ids(user_id)?
            .into_iter()
            .skip(offset)
            .take(limit)
        {
            if let Some(tx) = self.read_transaction(&id)? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    // =========================================================================
    // Grants
    // =========================================================================

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

        let _lock = self.lock_user(user_id);
        if let Some(id) = self.find_grant(user_id, period)? {
            return Ok(GrantOutcome::AlreadyGranted(id));
        }
        let entry = self.credit_locked(user_id, period.credits_per_month, draft)?;
        Ok(GrantOutcome::Granted(entry))
    }

    // =========================================================================
    // Usage Counters
    // =========================================================================

    async fn get_usage_counter(
        &self,
        user_id: &UserId,
        window: UsageWindow,
    ) -> Result<UsageCounter> {
        let _lock = self.lock_user(user_id);
        if let Some(counter) = self.read_counter(user_id, window)? {
            return Ok(counter);
        }
        let counter = UsageCounter::new(*user_id, window);
        self.write_counter(&counter)?;
        Ok(counter)
    }

    async fn increment_usage(
        &self,
        user_id: &UserId,
        window: UsageWindow,
        action: UsageAction,
    ) -> Result<UsageCounter> {
        let _lock = self.lock_user(user_id);
        let mut counter = self
            .read_counter(user_id, window)?
            .unwrap_or_else(|| UsageCounter::new(*user_id, window));
        counter.increment(action);
        self.write_counter(&counter)?;
        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn draft(kind: TransactionType) -> TransactionDraft {
        TransactionDraft::new(kind, kind.as_str(), Utc::now())
    }

    #[tokio::test]
    async fn credit_then_debit() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        store
            .apply_credit(&user_id, 50, draft(TransactionType::Purchase))
            .await
            .unwrap();
        let debit = store
            .apply_debit(&user_id, 20, draft(TransactionType::Usage))
            .await
            .unwrap();

        assert_eq!(debit.amount, -20);
        assert_eq!(debit.balance_after, 30);
        let row = store.get_balance_row(&user_id).await.unwrap().unwrap();
        assert_eq!(row.amount, 30);
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn overflowing_credit_is_rejected() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        store
            .apply_credit(&user_id, i64::MAX - 1, draft(TransactionType::Purchase))
            .await
            .unwrap();
        let err = store
            .apply_credit(&user_id, 2, draft(TransactionType::Bonus))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::BalanceOverflow { amount: 2 }));
        let row = store.get_balance_row(&user_id).await.unwrap().unwrap();
        assert_eq!(row.amount, i64::MAX - 1);
        assert_eq!(store.list_transactions(&user_id, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_debit_leaves_ledger_untouched() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store
            .apply_credit(&user_id, 5, draft(TransactionType::Bonus))
            .await
            .unwrap();

        let err = store
            .apply_debit(&user_id, 6, draft(TransactionType::Usage))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientCredits {
                required: 6,
                available: 5
            }
        ));
        assert_eq!(store.list_transactions(&user_id, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transactions_list_newest_first() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let other = UserId::generate();

        for amount in [10, 20, 30] {
            store
                .apply_credit(&user_id, amount, draft(TransactionType::Purchase))
                .await
                .unwrap();
        }
        store
            .apply_credit(&other, 99, draft(TransactionType::Purchase))
            .await
            .unwrap();

        let all = store.list_transactions(&user_id, 10, 0).await.unwrap();
        assert_eq!(all.iter().map(|t| t.amount).collect::<Vec<_>>(), [30, 20, 10]);

        let page = store.list_transactions(&user_id, 1, 1).await.unwrap();
        assert_eq!(page[0].amount, 20);

        let fetched = store.get_transaction(&all[0].id).await.unwrap().unwrap();
        assert_eq!(fetched, all[0]);
    }

    #[tokio::test]
    async fn expire_with_stale_version_is_a_no_op() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store
            .apply_credit(&user_id, 40, draft(TransactionType::Purchase))
            .await
            .unwrap();
        let stale = store.get_balance_row(&user_id).await.unwrap().unwrap();
        store
            .apply_credit(&user_id, 10, draft(TransactionType::Purchase))
            .await
            .unwrap();

        let outcome = store
            .expire_balance(&stale, draft(TransactionType::Expiration))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(store.get_balance_row(&user_id).await.unwrap().unwrap().amount, 50);
    }

    #[tokio::test]
    async fn grant_once_per_period() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let period = SubscriptionPeriod::calendar_month(Utc::now(), 25);

        let first = store
            .grant_once(&user_id, &period, draft(TransactionType::SubscriptionCredit), Duration::from_secs(1))
            .await
            .unwrap();
        let second = store
            .grant_once(&user_id, &period, draft(TransactionType::SubscriptionCredit), Duration::from_secs(1))
            .await
            .unwrap();

        let GrantOutcome::Granted(entry) = first else {
            panic!("first grant should write");
        };
        assert_eq!(second, GrantOutcome::AlreadyGranted(entry.id));
        assert_eq!(store.get_balance_row(&user_id).await.unwrap().unwrap().amount, 25);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let user_id = UserId::generate();
        let now = Utc::now();
        let window = UsageWindow::new(now, now + chrono::Duration::days(30));

        {
            let store = RocksStore::open(dir.path()).unwrap();
            store
                .apply_credit(&user_id, 7, draft(TransactionType::Purchase))
                .await
                .unwrap();
            store
                .increment_usage(&user_id, window, UsageAction::CreateCourse)
                .await
                .unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get_balance_row(&user_id).await.unwrap().unwrap().amount, 7);
        let counter = store.get_usage_counter(&user_id, window).await.unwrap();
        assert_eq!(counter.courses_created, 1);
    }
}
