use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stakeledger_core::{OwnerId, PositionId};

/// Envelope for an event, carrying the position it concerns and its place in
/// the ledger journal.
///
/// Notes:
/// - `sequence_number` is monotonically increasing across the whole journal,
///   starting at 1, so indexers can detect gaps.
/// - `payload` is the typed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    owner: OwnerId,
    position_id: PositionId,
    sequence_number: u64,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        owner: OwnerId,
        position_id: PositionId,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            owner,
            position_id,
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn position_id(&self) -> PositionId {
        self.position_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }
}

impl<E: Serialize> EventEnvelope<E> {
    /// Re-wrap with a JSON payload, for sinks that do not know the event type.
    pub fn to_json(&self) -> serde_json::Result<EventEnvelope<serde_json::Value>> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            owner: self.owner,
            position_id: self.position_id,
            sequence_number: self.sequence_number,
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_envelope_keeps_metadata() {
        let owner = OwnerId::new();
        let env = EventEnvelope::new(Uuid::now_v7(), owner, PositionId::new(3), 9, vec![1u8, 2]);

        let json = env.to_json().unwrap();
        assert_eq!(json.event_id(), env.event_id());
        assert_eq!(json.owner(), owner);
        assert_eq!(json.position_id(), PositionId::new(3));
        assert_eq!(json.sequence_number(), 9);
        assert_eq!(json.payload(), &serde_json::json!([1, 2]));
    }
}
