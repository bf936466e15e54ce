//! Ledger events: the audit record of every position mutation, plus the
//! pub/sub plumbing that distributes them to external indexers.

use chrono::{DateTime, Utc};

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};

/// A committed ledger fact. Never edited once journaled; a later mutation
/// is a new event.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name indexers route on, e.g. `staking.position.closed`.
    fn event_type(&self) -> &'static str;

    /// Payload schema revision. Bump on any field change.
    fn version(&self) -> u32;

    /// Clock time the mutation took effect.
    fn occurred_at(&self) -> DateTime<Utc>;
}
