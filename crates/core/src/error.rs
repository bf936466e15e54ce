//! Domain error model.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::id::PositionId;

/// Token amount in base units (e.g. 6-decimal micro-units).
pub type Amount = u128;

/// Result type used across the staking domain.
pub type StakeResult<T> = Result<T, StakeError>;

/// Staking-level error.
///
/// Every variant is terminal for the operation that raised it. The engine never
/// retries; the calling layer decides what to do next.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakeError {
    /// Stake amount is below the configured minimum.
    #[error("amount {amount} is below the minimum stake of {minimum}")]
    BelowMinimum { amount: Amount, minimum: Amount },

    /// The paying side of a transfer does not hold enough value.
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Amount, available: Amount },

    /// No position with this id exists for the given owner.
    #[error("position {0} not found")]
    NotFound(PositionId),

    /// The position has already been closed.
    #[error("position {0} is not active")]
    NotActive(PositionId),

    /// The lock period has not elapsed yet.
    #[error("position {position_id} is locked until {unlocks_at}")]
    LockNotElapsed {
        position_id: PositionId,
        unlocks_at: DateTime<Utc>,
    },

    /// No reward has accrued since the last settlement.
    #[error("position {0} has no reward to claim")]
    NothingToClaim(PositionId),

    /// The custody collaborator rejected a transfer.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Authorization failure, raised by the layer that gates callers.
    #[error("unauthorized")]
    Unauthorized,

    /// An amount computation left the representable range.
    #[error("arithmetic overflow in {0}")]
    ArithmeticOverflow(&'static str),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A ledger invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The store lock was poisoned by a panicking writer.
    #[error("position store lock poisoned")]
    StorePoisoned,
}

impl StakeError {
    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::TransferFailed(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Stable, machine-friendly name of the error kind (used in logs).
    pub fn kind(&self) -> &'static str {
        match self {
            StakeError::BelowMinimum { .. } => "below_minimum",
            StakeError::InsufficientFunds { .. } => "insufficient_funds",
            StakeError::NotFound(_) => "not_found",
            StakeError::NotActive(_) => "not_active",
            StakeError::LockNotElapsed { .. } => "lock_not_elapsed",
            StakeError::NothingToClaim(_) => "nothing_to_claim",
            StakeError::TransferFailed(_) => "transfer_failed",
            StakeError::Unauthorized => "unauthorized",
            StakeError::ArithmeticOverflow(_) => "arithmetic_overflow",
            StakeError::InvalidConfig(_) => "invalid_config",
            StakeError::InvariantViolation(_) => "invariant_violation",
            StakeError::StorePoisoned => "store_poisoned",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = StakeError::BelowMinimum {
            amount: 999_999,
            minimum: 1_000_000,
        };
        assert_eq!(
            err.to_string(),
            "amount 999999 is below the minimum stake of 1000000"
        );
        assert_eq!(err.kind(), "below_minimum");

        let err = StakeError::NotActive(PositionId::new(7));
        assert_eq!(err.to_string(), "position 7 is not active");
    }
}
