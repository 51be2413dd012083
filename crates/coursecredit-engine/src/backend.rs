//! Store selection from configuration.

use std::sync::Arc;

use coursecredit_store::{PgStore, Store, StoreError};

use crate::config::EngineConfig;

/// Open the store named by `config`.
///
/// `DATABASE_URL` selects PostgreSQL (migrations are applied on open).
/// Without it the store lives in `data_dir` when the `rocksdb-backend`
/// feature is enabled, and in memory otherwise.
///
/// # Errors
///
/// Returns an error if the database cannot be reached, migrated or opened.
pub async fn open_store(config: &EngineConfig) -> Result<Arc<dyn Store>, StoreError> {
    if let Some(url) = config.database_url.as_deref() {
        let store = PgStore::connect(url, config.max_connections).await?;
        store.migrate().await?;
        tracing::info!("Using PostgreSQL store");
        return Ok(Arc::new(store));
    }

    open_local(config)
}

#[cfg(feature = "rocksdb-backend")]
fn open_local(config: &EngineConfig) -> Result<Arc<dyn Store>, StoreError> {
    let store = coursecredit_store::RocksStore::open(&config.data_dir)?;
    tracing::info!(data_dir = %config.data_dir, "Using RocksDB store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "rocksdb-backend"))]
#[allow(clippy::unnecessary_wraps)]
fn open_local(_config: &EngineConfig) -> Result<Arc<dyn Store>, StoreError> {
    tracing::warn!("DATABASE_URL not set, using in-memory store");
    Ok(Arc::new(coursecredit_store::MemoryStore::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coursecredit_core::{TransactionDraft, TransactionType, UserId};

    #[cfg(not(feature = "rocksdb-backend"))]
    #[tokio::test]
    async fn no_database_url_opens_a_memory_store() {
        let store = open_store(&EngineConfig::default()).await.unwrap();
        let user_id = UserId::generate();

        store
            .apply_credit(
                &user_id,
                4,
                TransactionDraft::new(TransactionType::Bonus, "Welcome", Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(store.get_balance_row(&user_id).await.unwrap().unwrap().amount, 4);
    }

    #[cfg(feature = "rocksdb-backend")]
    #[tokio::test]
    async fn no_database_url_opens_rocksdb_in_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..EngineConfig::default()
        };
        let user_id = UserId::generate();

        {
            let store = open_store(&config).await.unwrap();
            store
                .apply_credit(
                    &user_id,
                    4,
                    TransactionDraft::new(TransactionType::Bonus, "Welcome", Utc::now()),
                )
                .await
                .unwrap();
        }

        let reopened = open_store(&config).await.unwrap();
        assert_eq!(reopened.get_balance_row(&user_id).await.unwrap().unwrap().amount, 4);
    }
}
