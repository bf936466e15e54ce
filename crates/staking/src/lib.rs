//! Stake accounting engine.
//!
//! Owners lock value for a fixed period and accrue a fixed APY. Closing and
//! claiming are taxed; reinvesting is not. Ledger state lives in the
//! [`PositionStore`]; [`StakingEngine`] runs the operations against it and
//! against the custody, clock and event bus collaborators.

pub mod accrual;
pub mod clock;
pub mod config;
pub mod custody;
pub mod engine;
pub mod position;
pub mod store;


pub use accrual::{accrued_reward, tax_on};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{StakingConfig, StakingTerms};
pub use custody::{Beneficiary, Custody, InMemoryCustody, Transfer};
pub use engine::{OwnerSummary, Outcome, Reconciliation, StakingEngine};
pub use position::{
    LockedDelta, Position, PositionAction, PositionClosed, PositionCommand, PositionOpened,
    PositionReinvested, RewardClaimed, StakeEvent,
};
pub use store::{OwnerAggregate, PositionStore, SystemAggregate};
