//! Platform / creator split of a course sale.
//!
//! All arithmetic is done in integer minor units (cents). The platform fee is
//! rounded first and the creator receives the exact remainder, so the two
//! parts always add back up to the gross amount.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Minor units per major currency unit.
pub const CENTS_PER_UNIT: i64 = 100;

/// The split of a gross sale between the platform and the creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitResult {
    /// Gross sale in cents.
    pub gross_cents: i64,
    /// Platform commission in cents.
    pub platform_fee_cents: i64,
    /// Creator payout in cents (`gross_cents - platform_fee_cents`).
    pub creator_cents: i64,
}

impl SplitResult {
    /// Gross amount in major units.
    #[must_use]
    pub fn gross_amount(&self) -> f64 {
        cents_to_amount(self.gross_cents)
    }

    /// Platform fee in major units.
    #[must_use]
    pub fn platform_fee(&self) -> f64 {
        cents_to_amount(self.platform_fee_cents)
    }

    /// Creator payout in major units.
    #[must_use]
    pub fn creator_amount(&self) -> f64 {
        cents_to_amount(self.creator_cents)
    }

    /// Payment instructions for a destination charge to the creator's account.
    #[must_use]
    pub fn transfer_to(&self, destination: impl Into<String>) -> PaymentTransfer {
        PaymentTransfer {
            amount_cents: self.gross_cents,
            application_fee_cents: self.platform_fee_cents,
            destination: destination.into(),
        }
    }
}

/// What the payment gateway needs to charge the buyer and route the payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransfer {
    /// Amount charged to the buyer.
    pub amount_cents: i64,
    /// Amount retained by the platform.
    pub application_fee_cents: i64,
    /// Connected account receiving the remainder.
    pub destination: String,
}

/// Split `gross_amount` (major units, e.g. `19.99`) at `commission_rate`.
///
/// The rate is clamped to `[0, 1]`.
///
/// # Errors
///
/// Returns `LedgerError::InvalidSplitInput` if either input is not finite or
/// the gross amount is negative or too large to represent in cents.
pub fn calculate_split(gross_amount: f64, commission_rate: f64) -> Result<SplitResult> {
    if !gross_amount.is_finite() || gross_amount < 0.0 {
        return Err(LedgerError::InvalidSplitInput(format!(
            "gross amount {gross_amount}"
        )));
    }
    let gross_cents = (gross_amount * 100.0).round();
    if gross_cents > MAX_EXACT_CENTS {
        return Err(LedgerError::InvalidSplitInput(format!(
            "gross amount {gross_amount} is too large"
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let gross_cents = gross_cents as i64;
    calculate_split_cents(gross_cents, commission_rate)
}

/// Split an amount already expressed in cents.
///
/// # Errors
///
/// Returns `LedgerError::InvalidSplitInput` if the rate is not finite or the
/// gross amount is negative.
pub fn calculate_split_cents(gross_cents: i64, commission_rate: f64) -> Result<SplitResult> {
    if !commission_rate.is_finite() {
        return Err(LedgerError::InvalidSplitInput(format!(
            "commission rate {commission_rate}"
        )));
    }
    if gross_cents < 0 {
        return Err(LedgerError::InvalidSplitInput(format!(
            "gross cents {gross_cents}"
        )));
    }
    let rate = commission_rate.clamp(0.0, 1.0);

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let platform_fee_cents = ((gross_cents as f64) * rate).round() as i64;
    let platform_fee_cents = platform_fee_cents.clamp(0, gross_cents);

    Ok(SplitResult {
        gross_cents,
        platform_fee_cents,
        creator_cents: gross_cents - platform_fee_cents,
    })
}

/// Largest cent amount an `f64` holds exactly (2^53).
const MAX_EXACT_CENTS: f64 = 9_007_199_254_740_992.0;

#[allow(clippy::cast_precision_loss)]
fn cents_to_amount(cents: i64) -> f64 {
    cents as f64 / CENTS_PER_UNIT as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixture_table() {
        // (gross, rate) -> (gross_cents, fee, creator)
        let fixtures = [
            (19.99, 0.15, 1999, 300, 1699),
            (100.0, 0.10, 10_000, 1000, 9000),
            (0.01, 0.5, 1, 1, 0),
            (0.03, 0.5, 3, 2, 1),
            (49.90, 0.0, 4990, 0, 4990),
            (49.90, 1.0, 4990, 4990, 0),
            (0.0, 0.2, 0, 0, 0),
            (10.0, 0.333, 1000, 333, 667),
        ];
        for (gross, rate, gross_cents, fee, creator) in fixtures {
            let split = calculate_split(gross, rate).unwrap();
            assert_eq!(
                (split.gross_cents, split.platform_fee_cents, split.creator_cents),
                (gross_cents, fee, creator),
                "gross={gross} rate={rate}"
            );
        }
    }

    #[test]
    fn rate_is_clamped() {
        let over = calculate_split(10.0, 1.5).unwrap();
        assert_eq!(over.platform_fee_cents, 1000);
        assert_eq!(over.creator_cents, 0);

        let under = calculate_split(10.0, -0.2).unwrap();
        assert_eq!(under.platform_fee_cents, 0);
        assert_eq!(under.creator_cents, 1000);
    }

    #[test]
    fn rejects_non_finite_and_negative_inputs() {
        assert!(calculate_split(f64::NAN, 0.1).is_err());
        assert!(calculate_split(f64::INFINITY, 0.1).is_err());
        assert!(calculate_split(-1.0, 0.1).is_err());
        assert!(calculate_split(10.0, f64::NAN).is_err());
        assert!(calculate_split_cents(-5, 0.1).is_err());
    }

    #[test]
    fn decimal_accessors_match_cents() {
        let split = calculate_split(19.99, 0.15).unwrap();
        assert!((split.platform_fee() - 3.00).abs() < f64::EPSILON);
        assert!((split.creator_amount() - 16.99).abs() < 1e-9);
        assert!((split.gross_amount() - 19.99).abs() < 1e-9);
    }

    #[test]
    fn transfer_carries_fee_and_destination() {
        let transfer = calculate_split(19.99, 0.15)
            .unwrap()
            .transfer_to("acct_creator");
        assert_eq!(transfer.amount_cents, 1999);
        assert_eq!(transfer.application_fee_cents, 300);
        assert_eq!(transfer.destination, "acct_creator");
    }

    proptest! {
        /// Property: fee and payout always add back up to the gross amount.
        #[test]
        fn prop_split_is_exact(gross_cents in 0i64..100_000_000, rate in 0.0f64..1.0) {
            let split = calculate_split_cents(gross_cents, rate).unwrap();
            prop_assert_eq!(split.platform_fee_cents + split.creator_cents, gross_cents);
            prop_assert!(split.platform_fee_cents >= 0);
            prop_assert!(split.creator_cents >= 0);
        }

        /// Property: the decimal entry point agrees with the cents entry point.
        #[test]
        fn prop_decimal_entry_matches_cents(gross_cents in 0i64..10_000_000, rate in 0.0f64..1.0) {
            #[allow(clippy::cast_precision_loss)]
            let gross = gross_cents as f64 / 100.0;
            let from_decimal = calculate_split(gross, rate).unwrap();
            let from_cents = calculate_split_cents(gross_cents, rate).unwrap();
            prop_assert_eq!(from_decimal, from_cents);
        }
    }
}
