use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Percent is carried in millionths of the amount so four decimal places stay exact.
const PERCENT_SCALE: i128 = 10_000;
const PARTS_PER_MILLION: i128 = 1_000_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSplit {
    pub application_fee_amount: i64,
    pub net_amount: i64,
}

/// How the platform fee is attached to a connected-account charge.
#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplicationFee {
    /// One-time charges carry the computed fee as a fixed amount.
    Fixed { amount: i64 },
    /// Recurring charges carry the percent; the processor applies it each cycle.
    Percent { percent: f64 },
}

/// Clamp a fee percent to [0, 100]. NaN is rejected rather than silently clamped.
pub fn clamp_percent(fee_percent: f64) -> BillingResult<f64> {
    if fee_percent.is_nan() {
        return Err(BillingError::validation("fee percent must be a number"));
    }
    Ok(fee_percent.clamp(0.0, 100.0))
}

/// `application_fee_amount = round_half_up(amount * percent / 100)`, `net = amount - fee`.
pub fn calculate_fee(amount: i64, fee_percent: f64) -> BillingResult<FeeSplit> {
    if amount < 0 {
        return Err(BillingError::validation("amount must be non-negative"));
    }
    let percent = clamp_percent(fee_percent)?;
    let parts = (percent * PERCENT_SCALE as f64).round() as i128;
    let fee = (i128::from(amount) * parts + PARTS_PER_MILLION / 2) / PARTS_PER_MILLION;
    // percent <= 100 keeps fee <= amount, so the narrowing cannot overflow
    let application_fee_amount = fee as i64;
    Ok(FeeSplit {
        application_fee_amount,
        net_amount: amount - application_fee_amount,
    })
}

/// Fee shape for a charge: fixed for one-time prices, percent for subscriptions.
pub fn application_fee_for(
    amount: i64,
    fee_percent: f64,
    recurring: bool,
) -> BillingResult<(ApplicationFee, FeeSplit)> {
    let split = calculate_fee(amount, fee_percent)?;
    let fee = if recurring {
        ApplicationFee::Percent {
            percent: clamp_percent(fee_percent)?,
        }
    } else {
        ApplicationFee::Fixed {
            amount: split.application_fee_amount,
        }
    };
    Ok((fee, split))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_percent_of_one_hundred_dollars() {
        let split = calculate_fee(10_000, 5.0).unwrap();
        assert_eq!(split.application_fee_amount, 500);
        assert_eq!(split.net_amount, 9_500);
    }

    #[test]
    fn half_cent_rounds_up() {
        // 2.5% of 1010 = 25.25 -> 25; 2.5% of 1020 = 25.5 -> 26
        assert_eq!(calculate_fee(1_010, 2.5).unwrap().application_fee_amount, 25);
        assert_eq!(calculate_fee(1_020, 2.5).unwrap().application_fee_amount, 26);
        // 0.5% of 100 = 0.5 -> 1
        assert_eq!(calculate_fee(100, 0.5).unwrap().application_fee_amount, 1);
    }

    #[test]
    fn fractional_percent_is_exact() {
        // 2.9% of 1_999 = 57.971 -> 58
        assert_eq!(calculate_fee(1_999, 2.9).unwrap().application_fee_amount, 58);
        // 1.15% of 200 = 2.3 -> 2 (float math would risk 2.2999...)
        assert_eq!(calculate_fee(200, 1.15).unwrap().application_fee_amount, 2);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(calculate_fee(1_000, 150.0).unwrap().application_fee_amount, 1_000);
        assert_eq!(calculate_fee(1_000, -3.0).unwrap().application_fee_amount, 0);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(matches!(calculate_fee(-1, 5.0), Err(BillingError::Validation(_))));
        assert!(matches!(calculate_fee(100, f64::NAN), Err(BillingError::Validation(_))));
    }

    #[test]
    fn fee_and_net_always_sum_to_amount() {
        for amount in (0..5_000).step_by(7) {
            for percent in [0.0, 0.25, 1.0, 2.5, 3.3333, 5.0, 12.5, 33.0, 99.99, 100.0] {
                let split = calculate_fee(amount, percent).unwrap();
                assert_eq!(split.application_fee_amount + split.net_amount, amount);
                assert!(split.application_fee_amount >= 0);
                assert!(split.application_fee_amount <= amount);
            }
        }
    }

    #[test]
    fn integer_percents_match_reference_rounding() {
        for amount in 0..2_000_i64 {
            for percent in 0..=100_i64 {
                let expected = (amount * percent * 2 + 100) / 200;
                let split = calculate_fee(amount, percent as f64).unwrap();
                assert_eq!(split.application_fee_amount, expected, "{amount} @ {percent}%");
            }
        }
    }

    #[test]
    fn recurring_charges_carry_percent() {
        let (fee, split) = application_fee_for(2_000, 10.0, true).unwrap();
        assert_eq!(fee, ApplicationFee::Percent { percent: 10.0 });
        assert_eq!(split.application_fee_amount, 200);

        let (fee, _) = application_fee_for(2_000, 10.0, false).unwrap();
        assert_eq!(fee, ApplicationFee::Fixed { amount: 200 });
    }
}
