//! Plan usage caps.
//!
//! Counters are kept per user per window: one for the billing period and, for
//! AI questions, one for the current UTC day. Checking never mutates; callers
//! increment only after the gated action succeeded.

use std::sync::Arc;

use tracing::{debug, warn};

use coursecredit_core::{
    day_bounds, decide, LimitScope, Result, UsageAction, UsageCounter, UsageDecision, UsageWindow,
    UserId,
};
use coursecredit_store::Store;

use crate::catalog::{resolve_entitlement, Entitlement, SubscriptionCatalog};
use crate::clock::Clock;
use crate::config::EngineConfig;

/// Enforces plan usage caps.
#[derive(Clone)]
pub struct UsageLimiter {
    store: Arc<dyn Store>,
    catalog: Arc<dyn SubscriptionCatalog>,
    clock: Arc<dyn Clock>,
    free_credits: i64,
}

impl UsageLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<dyn SubscriptionCatalog>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            free_credits: config.free_tier.credits_per_month,
        }
    }

    /// Whether the user may perform `action` now.
    ///
    /// A denial is returned as [`UsageDecision::Denied`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog or the store fails.
    pub async fn can_perform_action(
        &self,
        user_id: &UserId,
        action: UsageAction,
    ) -> Result<UsageDecision> {
        let (entitlement, windows) = self.windows(user_id).await?;
        let limits = entitlement.plan.limits;
        let plan_name = &entitlement.plan.name;

        let counter = self.store.get_usage_counter(user_id, windows.period).await?;
        let decision = decide(
            action,
            counter.get(action),
            limits.period_limit(action),
            LimitScope::Period,
            plan_name,
        );
        if !decision.is_allowed() {
            warn!(user_id = %user_id, action = %action, reason = decision.reason(), "Usage denied");
            return Ok(decision);
        }

        if let (Some(limit), Some(day)) = (limits.daily_limit(action), windows.day) {
            let daily = self.store.get_usage_counter(user_id, day).await?;
            let day_decision = decide(action, daily.get(action), limit, LimitScope::Day, plan_name);
            if !day_decision.is_allowed() {
                warn!(user_id = %user_id, action = %action, reason = day_decision.reason(), "Usage denied");
                return Ok(day_decision);
            }
        }

        debug!(user_id = %user_id, action = %action, ?decision, "Usage allowed");
        Ok(decision)
    }

    /// Record one `action` in the current period (and day, where the plan
    /// caps it daily). Returns the period counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog or the store fails.
    pub async fn increment_usage(
        &self,
        user_id: &UserId,
        action: UsageAction,
    ) -> Result<UsageCounter> {
        let (entitlement, windows) = self.windows(user_id).await?;

        let counter = self
            .store
            .increment_usage(user_id, windows.period, action)
            .await?;

        if let (Some(_), Some(day)) = (entitlement.plan.limits.daily_limit(action), windows.day) {
            self.store.increment_usage(user_id, day, action).await?;
        }

        debug!(
            user_id = %user_id,
            action = %action,
            count = counter.get(action),
            "Usage recorded"
        );
        Ok(counter)
    }

    async fn windows(&self, user_id: &UserId) -> Result<(Entitlement, Windows)> {
        let now = self.clock.now();
        let entitlement =
            resolve_entitlement(self.catalog.as_ref(), user_id, now, self.free_credits).await?;

        let period = UsageWindow::new(entitlement.period.period_start, entitlement.period.period_end);
        let (day_start, day_end) = day_bounds(now);
        let day = UsageWindow::new(day_start, day_end);

        // A period that is exactly today shares the day counter row.
        let windows = Windows {
            period,
            day: (day != period).then_some(day),
        };
        Ok((entitlement, windows))
    }
}

struct Windows {
    period: UsageWindow,
    day: Option<UsageWindow>,
}
