//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use coursecredit_core::{DEFAULT_EXPIRATION_MONTHS, FREE_PLAN_MONTHLY_CREDITS};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Free tier settings used when the catalog has no `free` plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeTierConfig {
    /// Credits granted per calendar month.
    pub credits_per_month: i64,
}

impl Default for FreeTierConfig {
    fn default() -> Self {
        Self {
            credits_per_month: FREE_PLAN_MONTHLY_CREDITS,
        }
    }
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL connection URL (optional; absent means an in-process store).
    pub database_url: Option<String>,

    /// Maximum pool connections (default: 10).
    pub max_connections: u32,

    /// Path to the `RocksDB` data directory, used by [`crate::open_store`]
    /// when `DATABASE_URL` is unset and `rocksdb-backend` is enabled
    /// (default: "/data/coursecredit").
    pub data_dir: String,

    /// Calendar months of inactivity before credits expire (default: 2).
    pub expiration_months: u32,

    /// Bounded wait for the per-user grant lock (default: 5s).
    pub grant_lock_timeout: Duration,

    /// Free tier settings.
    pub free_tier: FreeTierConfig,

    /// Largest transaction page returned in one call (default: 100).
    pub max_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            data_dir: "/data/coursecredit".into(),
            expiration_months: DEFAULT_EXPIRATION_MONTHS,
            grant_lock_timeout: Duration::from_millis(5000),
            free_tier: FreeTierConfig::default(),
            max_page_size: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a variable is set to a malformed value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a variable is set to a malformed value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            data_dir: lookup("DATA_DIR").unwrap_or(defaults.data_dir),
            expiration_months: parse_var(&lookup, "CREDIT_EXPIRATION_MONTHS")?
                .unwrap_or(defaults.expiration_months),
            grant_lock_timeout: parse_var(&lookup, "GRANT_LOCK_TIMEOUT_MS")?
                .map_or(defaults.grant_lock_timeout, Duration::from_millis),
            free_tier: FreeTierConfig {
                credits_per_month: parse_var(&lookup, "FREE_TIER_MONTHLY_CREDITS")?
                    .unwrap_or(defaults.free_tier.credits_per_month),
            },
            max_page_size: parse_var(&lookup, "MAX_TRANSACTIONS_PAGE")?
                .unwrap_or(defaults.max_page_size),
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}
