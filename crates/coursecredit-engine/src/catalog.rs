//! Subscription catalog boundary.
//!
//! Plans and subscriptions live outside the ledger. The engine only asks two
//! questions: which subscription is the user on, and what does a plan grant.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use coursecredit_core::{
    ActiveSubscription, LedgerError, Plan, Result, SubscriptionPeriod, UserId, FREE_PLAN_ID,
};

/// Read access to plans and active subscriptions.
#[async_trait]
pub trait SubscriptionCatalog: Send + Sync {
    /// The user's current subscription, if any.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Catalog` if the catalog cannot be reached.
    async fn active_subscription(&self, user_id: &UserId) -> Result<Option<ActiveSubscription>>;

    /// Look up a plan by id.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Catalog` if the catalog cannot be reached.
    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>>;
}

/// In-memory catalog for tests and single-tenant deployments.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    plans: RwLock<HashMap<String, Plan>>,
    subscriptions: RwLock<HashMap<UserId, ActiveSubscription>>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Self::insert_plan`].
    #[must_use]
    pub fn with_plan(self, plan: Plan) -> Self {
        self.insert_plan(plan);
        self
    }

    /// Add or replace a plan.
    pub fn insert_plan(&self, plan: Plan) {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan.id.clone(), plan);
    }

    /// Put a user on a subscription.
    pub fn subscribe(&self, user_id: UserId, subscription: ActiveSubscription) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, subscription);
    }

    /// Drop a user's subscription.
    pub fn unsubscribe(&self, user_id: &UserId) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
    }
}

#[async_trait]
impl SubscriptionCatalog for StaticCatalog {
    async fn active_subscription(&self, user_id: &UserId) -> Result<Option<ActiveSubscription>> {
        Ok(self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }

    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        Ok(self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plan_id)
            .cloned())
    }
}

/// The plan and billing period that currently apply to a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Entitlement {
    /// The governing plan.
    pub plan: Plan,
    /// The current billing period.
    pub period: SubscriptionPeriod,
}

impl Entitlement {
    /// Whether the user is on the free tier.
    #[must_use]
    pub fn is_free_tier(&self) -> bool {
        self.period.subscription_id.is_none()
    }
}

/// Resolve the entitlement of a user at `now`.
///
/// Users without a subscription, whose subscription is past due, or whose
/// reported period does not cover `now` fall back to the free tier over the
/// calendar month containing `now`. The catalog's own `free` plan is used
/// when it has one, otherwise `Plan::free(free_credits)`.
///
/// # Errors
///
/// - `LedgerError::PlanNotFound` if the subscription names an unknown plan
/// - `LedgerError::SubscriptionNotFound` if the subscription period ends before it starts
pub async fn resolve_entitlement(
    catalog: &dyn SubscriptionCatalog,
    user_id: &UserId,
    now: DateTime<Utc>,
    free_credits: i64,
) -> Result<Entitlement> {
    let subscription = catalog
        .active_subscription(user_id)
        .await?
        .filter(|s| s.status.is_entitled());

    if let Some(subscription) = subscription {
        if subscription.current_period_end < subscription.current_period_start {
            return Err(LedgerError::SubscriptionNotFound {
                user_id: user_id.to_string(),
            });
        }
        let plan = catalog
            .plan(&subscription.plan_id)
            .await?
            .ok_or_else(|| LedgerError::PlanNotFound {
                plan_id: subscription.plan_id.clone(),
            })?;
        let period = SubscriptionPeriod::from_subscription(&subscription, &plan);
        if period.contains(now) {
            return Ok(Entitlement { plan, period });
        }
        tracing::debug!(user_id = %user_id, "Subscription period is not current, using free tier");
    }

    let plan = catalog
        .plan(FREE_PLAN_ID)
        .await?
        .unwrap_or_else(|| Plan::free(free_credits));
    let period = SubscriptionPeriod::calendar_month(now, plan.credits_per_month);
    Ok(Entitlement { plan, period })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use coursecredit_core::{PlanLimits, SubscriptionId, SubscriptionStatus};

    fn pro() -> Plan {
        Plan {
            id: "pro".into(),
            name: "Pro".into(),
            credits_per_month: 100,
            commission_rate: 0.05,
            limits: PlanLimits::unlimited(),
        }
    }

    fn subscription(plan_id: &str, status: SubscriptionStatus, now: DateTime<Utc>) -> ActiveSubscription {
        ActiveSubscription {
            subscription_id: SubscriptionId::generate(),
            plan_id: plan_id.into(),
            status,
            current_period_start: now - Duration::days(3),
            current_period_end: now + Duration::days(27),
        }
    }

    #[tokio::test]
    async fn unsubscribed_user_gets_free_tier() {
        let catalog = StaticCatalog::new();
        let now = Utc::now();

        let entitlement = resolve_entitlement(&catalog, &UserId::generate(), now, 10)
            .await
            .unwrap();

        assert!(entitlement.is_free_tier());
        assert_eq!(entitlement.plan.id, FREE_PLAN_ID);
        assert_eq!(entitlement.period.credits_per_month, 10);
        assert!(entitlement.period.contains(now));
    }

    #[tokio::test]
    async fn subscription_period_comes_from_catalog() {
        let catalog = StaticCatalog::new().with_plan(pro());
        let user_id = UserId::generate();
        let now = Utc::now();
        let sub = subscription("pro", SubscriptionStatus::Active, now);
        catalog.subscribe(user_id, sub.clone());

        let entitlement = resolve_entitlement(&catalog, &user_id, now, 10).await.unwrap();

        assert_eq!(entitlement.plan.id, "pro");
        assert_eq!(entitlement.period.period_start, sub.current_period_start);
        assert_eq!(entitlement.period.subscription_id, Some(sub.subscription_id));
    }

    #[tokio::test]
    async fn past_due_subscription_falls_back_to_free() {
        let catalog = StaticCatalog::new().with_plan(pro());
        let user_id = UserId::generate();
        let now = Utc::now();
        catalog.subscribe(user_id, subscription("pro", SubscriptionStatus::PastDue, now));

        let entitlement = resolve_entitlement(&catalog, &user_id, now, 10).await.unwrap();
        assert!(entitlement.is_free_tier());
    }

    #[tokio::test]
    async fn lapsed_period_falls_back_to_free() {
        let catalog = StaticCatalog::new().with_plan(pro());
        let user_id = UserId::generate();
        let now = Utc::now();
        catalog.subscribe(
            user_id,
            subscription("pro", SubscriptionStatus::Cancelled, now - Duration::days(40)),
        );

        let entitlement = resolve_entitlement(&catalog, &user_id, now, 10).await.unwrap();
        assert!(entitlement.is_free_tier());
    }

    #[tokio::test]
    async fn unknown_plan_is_an_error() {
        let catalog = StaticCatalog::new();
        let user_id = UserId::generate();
        let now = Utc::now();
        catalog.subscribe(user_id, subscription("ghost", SubscriptionStatus::Active, now));

        let err = resolve_entitlement(&catalog, &user_id, now, 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::PlanNotFound { plan_id } if plan_id == "ghost"));
    }

    #[tokio::test]
    async fn inverted_period_is_rejected() {
        let catalog = StaticCatalog::new().with_plan(pro());
        let user_id = UserId::generate();
        let now = Utc::now();
        let mut sub = subscription("pro", SubscriptionStatus::Active, now);
        std::mem::swap(&mut sub.current_period_start, &mut sub.current_period_end);
        catalog.subscribe(user_id, sub);

        let err = resolve_entitlement(&catalog, &user_id, now, 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::SubscriptionNotFound { .. }));
    }
}
