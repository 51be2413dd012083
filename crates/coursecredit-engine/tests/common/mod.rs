//! Common test utilities for coursecredit engine integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use coursecredit_core::{
    ActiveSubscription, Plan, PlanLimits, SubscriptionId, SubscriptionStatus, UserId,
};
use coursecredit_engine::{Clock, Engine, EngineConfig, ManualClock, StaticCatalog};
use coursecredit_store::MemoryStore;

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The wired engine.
    pub engine: Engine,
    /// The backing store, for ledger audits.
    pub store: Arc<MemoryStore>,
    /// The catalog, for putting users on plans.
    pub catalog: Arc<StaticCatalog>,
    /// The clock driving periods and expiration.
    pub clock: Arc<ManualClock>,
    /// A fresh user.
    pub user_id: UserId,
}

impl TestHarness {
    /// Create a harness with default configuration, frozen at [`start`].
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    /// Create a harness with custom configuration.
    pub fn with_config(config: &EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(StaticCatalog::new().with_plan(pro_plan()));
        let clock = Arc::new(ManualClock::new(start()));

        let engine = Engine::new(store.clone(), catalog.clone(), clock.clone(), config);

        Self {
            engine,
            store,
            catalog,
            clock,
            user_id: UserId::generate(),
        }
    }

    /// Put the harness user on the pro plan for the month containing the clock.
    pub fn subscribe_pro(&self) -> ActiveSubscription {
        let now = self.clock.now();
        let (start, end) = coursecredit_core::calendar_month_bounds(now);
        let subscription = ActiveSubscription {
            subscription_id: SubscriptionId::generate(),
            plan_id: "pro".into(),
            status: SubscriptionStatus::Active,
            current_period_start: start,
            current_period_end: end,
        };
        self.catalog.subscribe(self.user_id, subscription.clone());
        subscription
    }

    /// Current balance of the harness user.
    pub async fn balance(&self) -> i64 {
        self.engine
            .ledger
            .get_balance(&self.user_id)
            .await
            .expect("balance read failed")
            .amount
    }

    /// Assert the stored balance equals the sum of the user's ledger entries.
    pub async fn assert_conserved(&self) {
        let balance = self.balance().await;
        assert_eq!(balance, self.store.ledger_sum(&self.user_id), "balance != ledger sum");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Instant every harness starts at: 2024-01-10 09:00 UTC.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap()
}

/// A paid plan with generous caps.
pub fn pro_plan() -> Plan {
    Plan {
        id: "pro".into(),
        name: "Pro".into(),
        credits_per_month: 100,
        commission_rate: 0.05,
        limits: PlanLimits {
            max_courses: 10,
            max_videos_per_month: -1,
            max_quizzes_per_month: 50,
            max_ai_questions_per_month: -1,
            max_ai_questions_per_day: -1,
        },
    }
}
