//! Credit expiration rule.
//!
//! A positive balance expires a fixed number of calendar months after the
//! user's most recent spend or most recent credit grant, whichever is later.
//! Refunds and expiration entries never move that date.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

/// Default expiration window in calendar months.
pub const DEFAULT_EXPIRATION_MONTHS: u32 = 2;

const SECONDS_PER_DAY: i64 = 86_400;

/// Latest ledger timestamps that drive expiration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityMarks {
    /// Most recent `usage` entry.
    pub last_debit_at: Option<DateTime<Utc>>,
    /// Most recent `purchase`, `subscription_credit`, or `bonus` entry.
    pub last_grant_at: Option<DateTime<Utc>>,
}

impl ActivityMarks {
    /// The later of the two marks.
    #[must_use]
    pub fn base_date(&self) -> Option<DateTime<Utc>> {
        self.last_debit_at.max(self.last_grant_at)
    }
}

/// Outcome of applying the rule to a stored balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationStatus {
    /// Nothing to expire (non-positive balance or no qualifying history).
    NeverExpires,
    /// Still spendable until `expires_at`.
    Active {
        /// Instant after which the balance is stale.
        expires_at: DateTime<Utc>,
        /// Whole days left, rounded up.
        expires_in_days: i64,
    },
    /// Stale; the whole balance must be written off.
    Expired {
        /// Instant the balance became stale.
        expired_at: DateTime<Utc>,
    },
}

/// The expiration rule with its window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    months: u32,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRATION_MONTHS)
    }
}

impl ExpirationPolicy {
    /// Create a policy with a window of `months` calendar months.
    #[must_use]
    pub const fn new(months: u32) -> Self {
        Self { months }
    }

    /// Window length in calendar months.
    #[must_use]
    pub const fn months(&self) -> u32 {
        self.months
    }

    /// `base` plus the window, clamping the day to the end of shorter months.
    ///
    /// Saturates at the maximum representable date.
    #[must_use]
    pub fn expires_at(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        base.checked_add_months(Months::new(self.months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Evaluate a stored `amount` against the user's activity at `now`.
    #[must_use]
    pub fn evaluate(&self, amount: i64, marks: ActivityMarks, now: DateTime<Utc>) -> ExpirationStatus {
        if amount <= 0 {
            return ExpirationStatus::NeverExpires;
        }
        let Some(base) = marks.base_date() else {
            return ExpirationStatus::NeverExpires;
        };

        let expires_at = self.expires_at(base);
        if now > expires_at {
            return ExpirationStatus::Expired {
                expired_at: expires_at,
            };
        }

        let remaining = (expires_at - now).num_seconds();
        ExpirationStatus::Active {
            expires_at,
            expires_in_days: (remaining + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn calendar_months_preserve_day_of_month() {
        let policy = ExpirationPolicy::new(2);
        assert_eq!(policy.expires_at(at(2024, 1, 15)), at(2024, 3, 15));
    }

    #[test]
    fn calendar_months_clamp_to_month_end() {
        let policy = ExpirationPolicy::new(1);
        assert_eq!(policy.expires_at(at(2024, 1, 31)), at(2024, 2, 29));
        assert_eq!(policy.expires_at(at(2023, 12, 31)), at(2024, 1, 31));
    }

    #[test]
    fn zero_or_negative_balance_never_expires() {
        let policy = ExpirationPolicy::default();
        let marks = ActivityMarks {
            last_debit_at: Some(at(2020, 1, 1)),
            last_grant_at: None,
        };
        assert_eq!(
            policy.evaluate(0, marks, at(2024, 1, 1)),
            ExpirationStatus::NeverExpires
        );
        assert_eq!(
            policy.evaluate(-5, marks, at(2024, 1, 1)),
            ExpirationStatus::NeverExpires
        );
    }

    #[test]
    fn no_history_never_expires() {
        let policy = ExpirationPolicy::default();
        assert_eq!(
            policy.evaluate(100, ActivityMarks::default(), at(2030, 1, 1)),
            ExpirationStatus::NeverExpires
        );
    }

    #[test]
    fn later_of_debit_and_grant_is_the_base() {
        let policy = ExpirationPolicy::new(2);
        let marks = ActivityMarks {
            last_debit_at: Some(at(2024, 3, 10)),
            last_grant_at: Some(at(2024, 1, 5)),
        };
        match policy.evaluate(10, marks, at(2024, 4, 10)) {
            ExpirationStatus::Active { expires_at, .. } => assert_eq!(expires_at, at(2024, 5, 10)),
            other => panic!("expected active, got {other:?}"),
        }
    }

    #[test]
    fn expires_strictly_after_the_deadline() {
        let policy = ExpirationPolicy::new(2);
        let marks = ActivityMarks {
            last_debit_at: None,
            last_grant_at: Some(at(2024, 1, 1)),
        };
        let deadline = at(2024, 3, 1);

        assert!(matches!(
            policy.evaluate(100, marks, deadline),
            ExpirationStatus::Active {
                expires_in_days: 0,
                ..
            }
        ));
        assert_eq!(
            policy.evaluate(100, marks, deadline + Duration::seconds(1)),
            ExpirationStatus::Expired {
                expired_at: deadline
            }
        );
    }

    #[test]
    fn days_remaining_round_up() {
        let policy = ExpirationPolicy::new(2);
        let marks = ActivityMarks {
            last_debit_at: None,
            last_grant_at: Some(at(2024, 1, 1)),
        };
        let now = at(2024, 2, 27) + Duration::hours(1);
        match policy.evaluate(100, marks, now) {
            ExpirationStatus::Active {
                expires_in_days, ..
            } => assert_eq!(expires_in_days, 3),
            other => panic!("expected active, got {other:?}"),
        }
    }
}
