//! `stakeledger-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot};
pub use error::{Amount, StakeError, StakeResult};
pub use id::{OwnerId, PositionId};
