//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a stake owner (account reference).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for OwnerId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<OwnerId> for Uuid {
    fn from(value: OwnerId) -> Self {
        value.0
    }
}

impl FromStr for OwnerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// Identifier of a stake position.
///
/// Issued from a single system-wide counter starting at 1. Never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(u64);

impl PositionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Zero-based arena slot for this id, `None` for the unissued id 0.
    pub fn slot(self) -> Option<usize> {
        self.0.checked_sub(1).and_then(|s| usize::try_from(s).ok())
    }
}

impl core::fmt::Display for PositionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<PositionId> for u64 {
    fn from(value: PositionId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_slot_is_zero_based() {
        assert_eq!(PositionId::new(0).slot(), None);
        assert_eq!(PositionId::new(1).slot(), Some(0));
        assert_eq!(PositionId::new(42).slot(), Some(41));
    }

    #[test]
    fn owner_id_round_trips_through_str() {
        let owner = OwnerId::new();
        let parsed: OwnerId = owner.to_string().parse().unwrap();
        assert_eq!(parsed, owner);
        assert!("not-a-uuid".parse::<OwnerId>().is_err());
    }
}
