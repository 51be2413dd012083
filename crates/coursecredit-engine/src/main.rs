//! Coursecredit migration runner.
//!
//! Applies the ledger schema to the database named by `DATABASE_URL`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coursecredit_engine::EngineConfig;
use coursecredit_store::PgStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,coursecredit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::error!("DATABASE_URL is not set");
        return Err("DATABASE_URL must be set to run migrations".into());
    };

    tracing::info!(max_connections = config.max_connections, "Connecting to PostgreSQL");
    let store = PgStore::connect(database_url, config.max_connections).await?;

    store.migrate().await?;
    tracing::info!("Ledger schema is up to date");

    Ok(())
}
