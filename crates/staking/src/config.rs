//! Staking configuration: rate, tax and lock terms.
//!
//! Terms are fixed for the lifetime of an engine. `StakingConfig` is the
//! serde-facing shape (env / JSON); `StakingTerms` is the validated `Copy`
//! value threaded through every decision.

use core::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use stakeledger_core::{Amount, StakeError, StakeResult};

pub const SECONDS_PER_DAY: i64 = 86_400;

/// 365-day year used for accrual.
pub const SECONDS_PER_YEAR: u64 = 365 * 86_400;

/// 10% APY expressed as a fraction.
pub const APY_NUMERATOR: u64 = 10;
pub const APY_DENOMINATOR: u64 = 100;

/// 0.5% exit tax.
pub const TAX_RATE_BPS: u64 = 50;
pub const BPS_DENOMINATOR: u64 = 10_000;

pub const LOCK_PERIOD_SECS: i64 = 30 * SECONDS_PER_DAY;

/// One whole token at 6 decimals.
pub const MIN_STAKE: Amount = 1_000_000;

/// Upper bound on the lock period (100 years).
const MAX_LOCK_PERIOD_SECS: i64 = 100 * 365 * SECONDS_PER_DAY;

const ENV_PREFIX: &str = "STAKELEDGER_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakingConfig {
    pub apy_numerator: u64,
    pub apy_denominator: u64,
    pub seconds_per_year: u64,
    pub tax_rate_bps: u64,
    pub lock_period_secs: i64,
    pub min_stake: Amount,
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            apy_numerator: APY_NUMERATOR,
            apy_denominator: APY_DENOMINATOR,
            seconds_per_year: SECONDS_PER_YEAR,
            tax_rate_bps: TAX_RATE_BPS,
            lock_period_secs: LOCK_PERIOD_SECS,
            min_stake: MIN_STAKE,
        }
    }
}

impl StakingConfig {
    pub fn validate(&self) -> StakeResult<()> {
        if self.apy_denominator == 0 {
            return Err(StakeError::invalid_config("apy_denominator must be non-zero"));
        }
        if self.seconds_per_year == 0 {
            return Err(StakeError::invalid_config("seconds_per_year must be non-zero"));
        }
        if self.tax_rate_bps >= BPS_DENOMINATOR {
            return Err(StakeError::invalid_config(format!(
                "tax_rate_bps must be below {BPS_DENOMINATOR}, got {}",
                self.tax_rate_bps
            )));
        }
        if self.lock_period_secs <= 0 || self.lock_period_secs > MAX_LOCK_PERIOD_SECS {
            return Err(StakeError::invalid_config(format!(
                "lock_period_secs must be in 1..={MAX_LOCK_PERIOD_SECS}, got {}",
                self.lock_period_secs
            )));
        }
        if self.min_stake == 0 {
            return Err(StakeError::invalid_config("min_stake must be non-zero"));
        }
        Ok(())
    }

    /// Validated terms for the accounting engine.
    pub fn terms(&self) -> StakeResult<StakingTerms> {
        self.validate()?;
        Ok(StakingTerms {
            apy_numerator: self.apy_numerator,
            apy_denominator: self.apy_denominator,
            seconds_per_year: self.seconds_per_year,
            tax_rate_bps: self.tax_rate_bps,
            lock_period: Duration::seconds(self.lock_period_secs),
            min_stake: self.min_stake,
        })
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> StakeResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| StakeError::invalid_config(format!("malformed config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `STAKELEDGER_*` environment variables.
    ///
    /// Unset variables take their defaults. Unparsable ones are logged and
    /// also fall back to the default.
    pub fn from_env() -> StakeResult<Self> {
        let defaults = Self::default();
        let config = Self {
            apy_numerator: env_or("APY_NUMERATOR", defaults.apy_numerator),
            apy_denominator: env_or("APY_DENOMINATOR", defaults.apy_denominator),
            seconds_per_year: env_or("SECONDS_PER_YEAR", defaults.seconds_per_year),
            tax_rate_bps: env_or("TAX_RATE_BPS", defaults.tax_rate_bps),
            lock_period_secs: env_or("LOCK_PERIOD_SECS", defaults.lock_period_secs),
            min_stake: env_or("MIN_STAKE", defaults.min_stake),
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_or<T>(suffix: &str, default: T) -> T
where
    T: FromStr + core::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    match std::env::var(&key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{key}={raw:?} is not valid; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

/// Rate, tax and lock terms in force for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakingTerms {
    pub apy_numerator: u64,
    pub apy_denominator: u64,
    pub seconds_per_year: u64,
    pub tax_rate_bps: u64,
    pub lock_period: Duration,
    pub min_stake: Amount,
}

impl Default for StakingTerms {
    fn default() -> Self {
        Self {
            apy_numerator: APY_NUMERATOR,
            apy_denominator: APY_DENOMINATOR,
            seconds_per_year: SECONDS_PER_YEAR,
            tax_rate_bps: TAX_RATE_BPS,
            lock_period: Duration::seconds(LOCK_PERIOD_SECS),
            min_stake: MIN_STAKE,
        }
    }
}
