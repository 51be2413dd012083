//! PostgreSQL storage implementation.
//!
//! Every primitive runs inside one database transaction. Debits and
//! expirations are conditional `UPDATE`s, so no row is ever read and then
//! written back. Monthly grants serialize on a transaction-scoped advisory
//! lock keyed by [`grant_lock_key`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use coursecredit_core::{
    ActivityMarks, Balance, CreditTransaction, RelatedEntity, SubscriptionPeriod,
    TransactionDraft, TransactionId, UsageAction, UsageCounter, UsageWindow, UserId,
};

use crate::error::{Result, StoreError};
use crate::{grant_lock_key, GrantOutcome, Store};

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE raised when a `BIGINT` result is out of range.
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

/// Pool acquire timeout.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(sqlx::FromRow)]
struct BalanceRow {
    user_id: Uuid,
    amount: i64,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
            updated_at: row.updated_at,
            version: row.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: String,
    user_id: Uuid,
    transaction_type: String,
    amount: i64,
    balance_after: i64,
    description: String,
    related_entity_id: Option<String>,
    related_entity_kind: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let id = row
            .id
            .parse::<TransactionId>()
            .map_err(|e| StoreError::Serialization(format!("transaction id {}: {e}", row.id)))?;
        let transaction_type = row
            .transaction_type
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?;
        let related_entity = match (row.related_entity_id, row.related_entity_kind) {
            (Some(id), Some(kind)) => Some(RelatedEntity { id, kind }),
            _ => None,
        };

        Ok(Self {
            id,
            user_id: UserId::from_uuid(row.user_id),
            transaction_type,
            amount: row.amount,
            balance_after: row.balance_after,
            description: row.description,
            related_entity,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    user_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    courses_created: i64,
    videos_uploaded: i64,
    quizzes_generated: i64,
    ai_questions_asked: i64,
}

impl From<UsageRow> for UsageCounter {
    fn from(row: UsageRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            period_start: row.period_start,
            period_end: row.period_end,
            courses_created: row.courses_created,
            videos_uploaded: row.videos_uploaded,
            quizzes_generated: row.quizzes_generated,
            ai_questions_asked: row.ai_questions_asked,
        }
    }
}

fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

/// `lock_timeout` in whole milliseconds, never 0 (which Postgres reads as "wait forever").
fn lock_timeout_ms(timeout: Duration) -> u128 {
    timeout.as_millis().max(1)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// PostgreSQL-backed ledger store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        tracing::info!(max_connections, "Database pool created");
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    // =========================================================================
    // Statement helpers (run on a caller-owned transaction)
    // =========================================================================

    async fn append(conn: &mut PgConnection, entry: &CreditTransaction) -> Result<()> {
        let (related_id, related_kind) = entry
            .related_entity
            .as_ref()
            .map_or((None, None), |r| (Some(r.id.as_str()), Some(r.kind.as_str())));

        sqlx::query(
            r"
            INSERT INTO credit_transactions (
                id, user_id, transaction_type, amount, balance_after,
                description, related_entity_id, related_entity_kind, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(entry.id.to_string())
        .bind(entry.user_id.as_uuid())
        .bind(entry.transaction_type.as_str())
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(&entry.description)
        .bind(related_id)
        .bind(related_kind)
        .bind(entry.created_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn credit_in(
        conn: &mut PgConnection,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let balance_after: i64 = sqlx::query_scalar(
            r"
            INSERT INTO credit_balances (user_id, amount, updated_at, version)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_id) DO UPDATE SET
                amount = credit_balances.amount + EXCLUDED.amount,
                updated_at = EXCLUDED.updated_at,
                version = credit_balances.version + 1
            RETURNING amount
            ",
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .bind(draft.created_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if has_sqlstate(&e, NUMERIC_VALUE_OUT_OF_RANGE) {
                StoreError::BalanceOverflow { amount }
            } else {
                e.into()
            }
        })?;

        let entry = draft.into_transaction(*user_id, amount, balance_after);
        Self::append(conn, &entry).await?;
        Ok(entry)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_balance_row(&self, user_id: &UserId) -> Result<Option<Balance>> {
        let row = sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, amount, updated_at, version FROM credit_balances WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, draft), fields(kind = %draft.transaction_type))]
    async fn apply_credit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let mut tx = self.pool.begin().await?;
        let entry = Self::credit_in(&mut tx, user_id, amount, draft).await?;
        tx.commit().await?;
        Ok(entry)
    }

    #[instrument(skip(self, draft))]
    async fn apply_debit(
        &self,
        user_id: &UserId,
        amount: i64,
        draft: TransactionDraft,
    ) -> Result<CreditTransaction> {
        let mut tx = self.pool.begin().await?;

        let balance_after: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE credit_balances
            SET amount = amount - $2, updated_at = $3, version = version + 1
            WHERE user_id = $1 AND amount >= $2
            RETURNING amount
            ",
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .bind(draft.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance_after else {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT amount FROM credit_balances WHERE user_id = $1")
                    .bind(user_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            debug!(required = amount, ?available, "Conditional debit matched no row");
            return Err(StoreError::InsufficientCredits {
                required: amount,
                available: available.unwrap_or(0),
            });
        };

        let entry = draft.into_transaction(*user_id, -amount, balance_after);
        Self::append(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(entry)
    }

    #[instrument(skip(self, draft), fields(user_id = %observed.user_id, version = observed.version))]
    async fn expire_balance(
        &self,
        observed: &Balance,
        draft: TransactionDraft,
    ) -> Result<Option<CreditTransaction>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE credit_balances
            SET amount = 0, updated_at = $3, version = version + 1
            WHERE user_id = $1 AND version = $2 AND amount = $4 AND amount > 0
            ",
        )
        .bind(observed.user_id.as_uuid())
        .bind(observed.version)
        .bind(draft.created_at)
        .bind(observed.amount)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }

        let entry = draft.into_transaction(observed.user_id, -observed.amount, 0);
        Self::append(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn latest_activity(&self, user_id: &UserId) -> Result<ActivityMarks> {
        let (last_debit_at, last_grant_at): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as(
                r"
                SELECT
                    MAX(created_at) FILTER (WHERE transaction_type = 'usage'),
                    MAX(created_at) FILTER (
                        WHERE transaction_type IN ('purchase', 'subscription_credit', 'bonus')
                    )
                FROM credit_transactions
                WHERE user_id = $1
                ",
            )
            .bind(user_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;

        Ok(ActivityMarks {
            last_debit_at,
            last_grant_at,
        })
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        sqlx::query_as::<_, TransactionRow>(
            r"
            SELECT id, user_id, transaction_type, amount, balance_after, description,
                   related_entity_id, related_entity_kind, created_at
            FROM credit_transactions
            WHERE id = $1
            ",
        )
        .bind(transaction_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(CreditTransaction::try_from)
        .transpose()
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        sqlx::query_as::<_, TransactionRow>(
            r"
            SELECT id, user_id, transaction_type, amount, balance_after, description,
                   related_entity_id, related_entity_kind, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(user_id.as_uuid())
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(CreditTransaction::try_from)
        .collect()
    }

    #[instrument(skip(self, period, draft), fields(period = %period.key()))]
    async fn grant_once(
        &self,
        user_id: &UserId,
        period: &SubscriptionPeriod,
        draft: TransactionDraft,
        lock_timeout: Duration,
    ) -> Result<GrantOutcome> {
        let key = grant_lock_key(user_id);
        let mut tx = self.pool.begin().await?;

        // SET does not take bind parameters; the value is an integer we format.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout_ms(lock_timeout)))
            .execute(&mut *tx)
            .await?;

        if let Err(err) = sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&key)
            .execute(&mut *tx)
            .await
        {
            if has_sqlstate(&err, LOCK_NOT_AVAILABLE) {
                warn!(%key, "Timed out waiting for grant lock");
                return Err(StoreError::LockTimeout {
                    key,
                    user_id: user_id.to_string(),
                });
            }
            return Err(err.into());
        }

        let existing: Option<String> = sqlx::query_scalar(
            r"
            SELECT id FROM credit_transactions
            WHERE user_id = $1
              AND transaction_type = 'subscription_credit'
              AND created_at BETWEEN $2 AND $3
            LIMIT 1
            ",
        )
        .bind(user_id.as_uuid())
        .bind(period.period_start)
        .bind(period.period_end)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(id) = existing {
            tx.commit().await?;
            let id = id
                .parse()
                .map_err(|e| StoreError::Serialization(format!("transaction id {id}: {e}")))?;
            return Ok(GrantOutcome::AlreadyGranted(id));
        }

        let entry = Self::credit_in(&mut tx, user_id, period.credits_per_month, draft).await?;
        tx.commit().await?;
        Ok(GrantOutcome::Granted(entry))
    }

    async fn get_usage_counter(
        &self,
        user_id: &UserId,
        window: UsageWindow,
    ) -> Result<UsageCounter> {
        sqlx::query(
            r"
            INSERT INTO usage_counters (user_id, period_start, period_end)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, period_start, period_end) DO NOTHING
            ",
        )
        .bind(user_id.as_uuid())
        .bind(window.start)
        .bind(window.end)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, UsageRow>(
            r"
            SELECT user_id, period_start, period_end, courses_created,
                   videos_uploaded, quizzes_generated, ai_questions_asked
            FROM usage_counters
            WHERE user_id = $1 AND period_start = $2 AND period_end = $3
            ",
        )
        .bind(user_id.as_uuid())
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn increment_usage(
        &self,
        user_id: &UserId,
        window: UsageWindow,
        action: UsageAction,
    ) -> Result<UsageCounter> {
        let column = action.counter_name();
        let sql = format!(
            r"
            INSERT INTO usage_counters (user_id, period_start, period_end, {column})
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_id, period_start, period_end) DO UPDATE SET
                {column} = usage_counters.{column} + 1
            RETURNING user_id, period_start, period_end, courses_created,
                      videos_uploaded, quizzes_generated, ai_questions_asked
            "
        );

        let row = sqlx::query_as::<_, UsageRow>(&sql)
            .bind(user_id.as_uuid())
            .bind(window.start)
            .bind(window.end)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_never_unbounded() {
        assert_eq!(lock_timeout_ms(Duration::ZERO), 1);
        assert_eq!(lock_timeout_ms(Duration::from_micros(300)), 1);
        assert_eq!(lock_timeout_ms(Duration::from_millis(250)), 250);
    }
}
