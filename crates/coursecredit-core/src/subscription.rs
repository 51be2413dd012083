//! Plans, subscriptions, and billing periods.
//!
//! Plans and subscriptions are owned by the external subscription catalog;
//! these types are the shape in which the catalog hands them to the ledger.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::UsageAction;
use crate::SubscriptionId;

// ============================================================================
// Constants
// ============================================================================

/// Plan id of the implicit tier used when a user has no active subscription.
pub const FREE_PLAN_ID: &str = "free";

/// Monthly credits granted on the free tier.
pub const FREE_PLAN_MONTHLY_CREDITS: i64 = 10;

/// Commission retained by the platform on free-tier course sales.
pub const FREE_PLAN_COMMISSION_RATE: f64 = 0.15;

/// Limit sentinel: no cap.
pub const UNLIMITED: i64 = -1;

/// Limit sentinel: feature not available on the plan.
pub const UNAVAILABLE: i64 = 0;

/// A subscription plan as described by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Catalog id of the plan.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Credits granted once per billing period.
    pub credits_per_month: i64,

    /// Fraction of a course sale retained by the platform.
    pub commission_rate: f64,

    /// Usage caps.
    pub limits: PlanLimits,
}

impl Plan {
    /// The implicit free tier with the given monthly allotment.
    #[must_use]
    pub fn free(credits_per_month: i64) -> Self {
        Self {
            id: FREE_PLAN_ID.to_string(),
            name: "Free".to_string(),
            credits_per_month,
            commission_rate: FREE_PLAN_COMMISSION_RATE,
            limits: PlanLimits::free(),
        }
    }
}

/// Usage caps of a plan.
///
/// Every field uses the sentinels [`UNLIMITED`] (`-1`) and [`UNAVAILABLE`] (`0`);
/// any positive value is a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Courses a creator may create per period.
    pub max_courses: i64,
    /// Videos uploaded per period.
    pub max_videos_per_month: i64,
    /// Quizzes generated per period.
    pub max_quizzes_per_month: i64,
    /// AI questions asked per period.
    pub max_ai_questions_per_month: i64,
    /// AI questions asked per UTC day.
    pub max_ai_questions_per_day: i64,
}

impl PlanLimits {
    /// Limits of the free tier.
    #[must_use]
    pub const fn free() -> Self {
        Self {
            max_courses: 1,
            max_videos_per_month: 5,
            max_quizzes_per_month: UNAVAILABLE,
            max_ai_questions_per_month: 20,
            max_ai_questions_per_day: 5,
        }
    }

    /// No caps at all.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_courses: UNLIMITED,
            max_videos_per_month: UNLIMITED,
            max_quizzes_per_month: UNLIMITED,
            max_ai_questions_per_month: UNLIMITED,
            max_ai_questions_per_day: UNLIMITED,
        }
    }

    /// The per-period cap for an action.
    #[must_use]
    pub const fn period_limit(&self, action: UsageAction) -> UsageLimit {
        UsageLimit::from_sentinel(match action {
            UsageAction::CreateCourse => self.max_courses,
            UsageAction::UploadVideo => self.max_videos_per_month,
            UsageAction::GenerateQuiz => self.max_quizzes_per_month,
            UsageAction::AskAiQuestion => self.max_ai_questions_per_month,
        })
    }

    /// The per-day cap for an action, if the plan has one.
    #[must_use]
    pub const fn daily_limit(&self, action: UsageAction) -> Option<UsageLimit> {
        match action {
            UsageAction::AskAiQuestion => {
                Some(UsageLimit::from_sentinel(self.max_ai_questions_per_day))
            }
            _ => None,
        }
    }
}

/// A decoded plan limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum UsageLimit {
    /// No cap.
    Unlimited,
    /// The action is not offered on the plan.
    Unavailable,
    /// At most this many per window.
    Capped(i64),
}

impl UsageLimit {
    /// Decode the `-1` / `0` / `n` sentinel convention.
    ///
    /// Any negative value is read as unlimited.
    #[must_use]
    pub const fn from_sentinel(value: i64) -> Self {
        if value < 0 {
            Self::Unlimited
        } else if value == 0 {
            Self::Unavailable
        } else {
            Self::Capped(value)
        }
    }

    /// Encode back into the sentinel convention.
    #[must_use]
    pub const fn as_sentinel(&self) -> i64 {
        match self {
            Self::Unlimited => UNLIMITED,
            Self::Unavailable => UNAVAILABLE,
            Self::Capped(n) => *n,
        }
    }
}

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active.
    Active,

    /// Subscription was cancelled (still active until period end).
    Cancelled,

    /// Payment failed, subscription is past due.
    PastDue,
}

impl SubscriptionStatus {
    /// Whether the subscription still entitles the user to its plan.
    #[must_use]
    pub const fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Cancelled)
    }
}

/// A user's current subscription as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    /// Catalog id of the subscription.
    pub subscription_id: SubscriptionId,

    /// Plan the subscription is on.
    pub plan_id: String,

    /// Current status.
    pub status: SubscriptionStatus,

    /// Start of the current billing period.
    pub current_period_start: DateTime<Utc>,

    /// End of the current billing period.
    pub current_period_end: DateTime<Utc>,
}

/// The window over which a monthly allotment and usage caps apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPeriod {
    /// Inclusive start.
    pub period_start: DateTime<Utc>,
    /// Inclusive end.
    pub period_end: DateTime<Utc>,
    /// Credits granted for this period.
    pub credits_per_month: i64,
    /// The subscription backing the period; `None` on the free tier.
    pub subscription_id: Option<SubscriptionId>,
}

impl SubscriptionPeriod {
    /// Period of an active subscription.
    #[must_use]
    pub fn from_subscription(subscription: &ActiveSubscription, plan: &Plan) -> Self {
        Self {
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            credits_per_month: plan.credits_per_month,
            subscription_id: Some(subscription.subscription_id),
        }
    }

    /// The UTC calendar month containing `now`, used for unsubscribed users.
    #[must_use]
    pub fn calendar_month(now: DateTime<Utc>, credits_per_month: i64) -> Self {
        let (start, end) = calendar_month_bounds(now);
        Self {
            period_start: start,
            period_end: end,
            credits_per_month,
            subscription_id: None,
        }
    }

    /// Whether `at` falls inside `[period_start, period_end]`.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.period_start <= at && at <= self.period_end
    }

    /// A stable key identifying the period, e.g. for lock names and references.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}..{}", self.period_start.to_rfc3339(), self.period_end.to_rfc3339())
    }
}

/// First and last instant of the UTC calendar month containing `now`.
#[must_use]
pub fn calendar_month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = start
        .checked_add_months(Months::new(1))
        .map_or(DateTime::<Utc>::MAX_UTC, |next| next - chrono::Duration::microseconds(1));
    (start, end)
}

/// First and last instant of the UTC day containing `now`.
#[must_use]
pub fn day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = start + chrono::Duration::days(1) - chrono::Duration::microseconds(1);
    (start, end)
}
