//! Reward and tax arithmetic.
//!
//! All division floors. Sub-unit reward is dropped at each settlement and is
//! never recovered later.

use stakeledger_core::{Amount, StakeError, StakeResult};

use crate::config::{BPS_DENOMINATOR, StakingTerms};

/// `principal * apy * elapsed / seconds_per_year`, floored.
///
/// Non-positive `elapsed_secs` accrues nothing.
pub fn accrued_reward(principal: Amount, elapsed_secs: i64, terms: &StakingTerms) -> StakeResult<Amount> {
    if elapsed_secs <= 0 || principal == 0 {
        return Ok(0);
    }

    let numerator = principal
        .checked_mul(Amount::from(terms.apy_numerator))
        .and_then(|v| v.checked_mul(elapsed_secs as Amount))
        .ok_or(StakeError::ArithmeticOverflow("reward"))?;
    let denominator = Amount::from(terms.apy_denominator) * Amount::from(terms.seconds_per_year);

    Ok(numerator / denominator)
}

/// `amount * tax_rate_bps / 10_000`, floored.
pub fn tax_on(amount: Amount, terms: &StakingTerms) -> StakeResult<Amount> {
    amount
        .checked_mul(Amount::from(terms.tax_rate_bps))
        .map(|v| v / Amount::from(BPS_DENOMINATOR))
        .ok_or(StakeError::ArithmeticOverflow("tax"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECONDS_PER_DAY;
    use proptest::prelude::*;

    const THOUSAND_TOKENS: Amount = 1_000_000_000;

    #[test]
    fn thirty_days_on_a_thousand_tokens() {
        let terms = StakingTerms::default();
        let reward = accrued_reward(THOUSAND_TOKENS, 30 * SECONDS_PER_DAY, &terms).unwrap();
        assert_eq!(reward, 8_219_178);
        assert_eq!(tax_on(THOUSAND_TOKENS + reward, &terms).unwrap(), 5_041_095);
    }

    #[test]
    fn fifteen_days_on_a_thousand_tokens() {
        let terms = StakingTerms::default();
        let reward = accrued_reward(THOUSAND_TOKENS, 15 * SECONDS_PER_DAY, &terms).unwrap();
        assert_eq!(reward, 4_109_589);
        assert_eq!(tax_on(reward, &terms).unwrap(), 20_547);
    }

    #[test]
    fn no_time_no_reward() {
        let terms = StakingTerms::default();
        assert_eq!(accrued_reward(THOUSAND_TOKENS, 0, &terms).unwrap(), 0);
        assert_eq!(accrued_reward(THOUSAND_TOKENS, -60, &terms).unwrap(), 0);
    }

    #[test]
    fn dust_truncates_to_zero() {
        let terms = StakingTerms::default();
        // 1 token for 1 second is ~0.0032 base units.
        assert_eq!(accrued_reward(1_000_000, 1, &terms).unwrap(), 0);
        assert_eq!(tax_on(199, &terms).unwrap(), 0);
        assert_eq!(tax_on(200, &terms).unwrap(), 1);
    }

    #[test]
    fn overflow_is_reported() {
        let terms = StakingTerms::default();
        assert_eq!(
            accrued_reward(Amount::MAX, 10, &terms),
            Err(StakeError::ArithmeticOverflow("reward"))
        );
        assert_eq!(tax_on(Amount::MAX, &terms), Err(StakeError::ArithmeticOverflow("tax")));
    }

    proptest! {
        /// Splitting an interval never yields more than accruing it in one go.
        #[test]
        fn split_accrual_never_exceeds_whole(
            principal in 1u128..1_000_000_000_000_000u128,
            first in 0i64..(365 * SECONDS_PER_DAY),
            second in 0i64..(365 * SECONDS_PER_DAY),
        ) {
            let terms = StakingTerms::default();
            let whole = accrued_reward(principal, first + second, &terms).unwrap();
            let split = accrued_reward(principal, first, &terms).unwrap()
                + accrued_reward(principal, second, &terms).unwrap();
            prop_assert!(split <= whole);
            prop_assert!(whole - split <= 1);
        }

        #[test]
        fn tax_never_exceeds_amount(amount in 0u128..u64::MAX as u128) {
            let terms = StakingTerms::default();
            prop_assert!(tax_on(amount, &terms).unwrap() <= amount);
        }
    }
}
