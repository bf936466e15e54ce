//! Accounting engine: the four position-mutating operations plus read-only
//! queries over the store.
//!
//! The engine holds collaborators, never ledger state. Each operation reads the
//! clock once, builds a `PositionCommand`, and runs one store transaction in
//! which the position aggregate decides, the store applies, and custody
//! settles. The committed event is then published on the bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use stakeledger_core::{Aggregate, Amount, OwnerId, PositionId, StakeError, StakeResult};
use stakeledger_events::{Event, EventBus, EventEnvelope};

use crate::clock::Clock;
use crate::config::{StakingConfig, StakingTerms};
use crate::custody::{Custody, Transfer};
use crate::position::{Position, PositionAction, PositionCommand, StakeEvent};
use crate::store::{PositionStore, SystemAggregate};

/// Result of a successful operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// The journaled event.
    pub envelope: EventEnvelope<StakeEvent>,
    /// Value movement that was settled, in order.
    pub transfers: Vec<Transfer>,
}

impl Outcome {
    pub fn event(&self) -> &StakeEvent {
        self.envelope.payload()
    }

    pub fn position_id(&self) -> PositionId {
        self.envelope.position_id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSummary {
    pub owner: OwnerId,
    pub total_locked: Amount,
    pub total_rewards_paid: Amount,
    /// Reward accrued across active positions as of `as_of`.
    pub pending_rewards: Amount,
    pub positions: Vec<Position>,
    pub as_of: DateTime<Utc>,
}

/// Store totals checked against what custody actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub system: SystemAggregate,
    pub custody_held: Amount,
    /// Custody balance beyond locked principal (the reward reserve).
    pub surplus: Amount,
}

pub struct StakingEngine<C, K, B> {
    terms: StakingTerms,
    store: Arc<PositionStore>,
    custody: C,
    clock: K,
    bus: B,
}

impl<C, K, B> StakingEngine<C, K, B>
where
    C: Custody,
    K: Clock,
    B: EventBus<EventEnvelope<StakeEvent>>,
{
    pub fn new(config: &StakingConfig, store: Arc<PositionStore>, custody: C, clock: K, bus: B) -> StakeResult<Self> {
        Ok(Self {
            terms: config.terms()?,
            store,
            custody,
            clock,
            bus,
        })
    }

    pub fn terms(&self) -> &StakingTerms {
        &self.terms
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    /// Lock `amount` for the configured period.
    #[instrument(skip(self), err)]
    pub fn open(&self, owner: OwnerId, amount: Amount) -> StakeResult<Outcome> {
        self.execute(owner, None, PositionAction::Open { amount })
    }

    /// Withdraw principal plus reward, minus tax on both, once unlocked.
    #[instrument(skip(self), err)]
    pub fn close(&self, owner: OwnerId, position_id: PositionId) -> StakeResult<Outcome> {
        self.execute(owner, Some(position_id), PositionAction::Close)
    }

    /// Fold accrued reward into principal and restart the lock. Untaxed.
    #[instrument(skip(self), err)]
    pub fn reinvest(&self, owner: OwnerId, position_id: PositionId) -> StakeResult<Outcome> {
        self.execute(owner, Some(position_id), PositionAction::Reinvest)
    }

    /// Pay out accrued reward minus tax; principal stays locked.
    #[instrument(skip(self), err)]
    pub fn claim(&self, owner: OwnerId, position_id: PositionId) -> StakeResult<Outcome> {
        self.execute(owner, Some(position_id), PositionAction::Claim)
    }

    fn execute(&self, owner: OwnerId, target: Option<PositionId>, action: PositionAction) -> StakeResult<Outcome> {
        let command = PositionCommand {
            action,
            terms: self.terms,
            occurred_at: self.clock.now(),
        };
        let decide = |position: &Position| position.handle(&command);
        let settle = |events: &[StakeEvent]| self.settle(events);

        let committed = match target {
            None => self.store.open_with(owner, decide, settle),
            Some(id) => self.store.mutate_with(owner, id, decide, settle),
        }
        .inspect_err(|err| {
            warn!(
                operation = action.name(),
                kind = err.kind(),
                owner = %owner,
                "operation rejected"
            )
        })?;

        let envelope = committed
            .into_iter()
            .next()
            .ok_or_else(|| StakeError::invariant(format!("{} committed no event", action.name())))?;
        let transfers = envelope.payload().transfers();

        info!(
            operation = action.name(),
            event_type = envelope.payload().event_type(),
            owner = %owner,
            position_id = %envelope.position_id(),
            sequence = envelope.sequence_number(),
            "position mutated"
        );

        // The journal already holds the event; a failed publish is recoverable from it.
        if let Err(err) = self.bus.publish(envelope.clone()) {
            error!(
                sequence = envelope.sequence_number(),
                "failed to publish ledger event: {err:?}"
            );
        }

        Ok(Outcome { envelope, transfers })
    }

    fn settle(&self, events: &[StakeEvent]) -> StakeResult<()> {
        let transfers: Vec<Transfer> = events.iter().flat_map(StakeEvent::transfers).collect();
        if transfers.is_empty() {
            return Ok(());
        }
        debug!(count = transfers.len(), "settling transfers");
        self.custody.settle(&transfers)
    }

    pub fn position(&self, owner: OwnerId, position_id: PositionId) -> StakeResult<Position> {
        self.store.get(owner, position_id)
    }

    pub fn positions(&self, owner: OwnerId) -> StakeResult<Vec<PositionId>> {
        self.store.list_positions(owner)
    }

    /// Reward accrued right now, before tax.
    pub fn pending_reward(&self, owner: OwnerId, position_id: PositionId) -> StakeResult<Amount> {
        self.store
            .get(owner, position_id)?
            .reward(self.clock.now(), &self.terms)
    }

    /// Whole seconds until the lock elapses, 0 once it has.
    pub fn unlocks_in(&self, owner: OwnerId, position_id: PositionId) -> StakeResult<i64> {
        let position = self.store.get(owner, position_id)?;
        Ok((position.end_time() - self.clock.now()).num_seconds().max(0))
    }

    pub fn owner_summary(&self, owner: OwnerId) -> StakeResult<OwnerSummary> {
        let now = self.clock.now();
        let aggregate = self.store.owner_aggregate(owner)?;
        let positions = self.store.positions_of(owner)?;

        let mut pending_rewards: Amount = 0;
        for position in &positions {
            pending_rewards = pending_rewards
                .checked_add(position.reward(now, &self.terms)?)
                .ok_or(StakeError::ArithmeticOverflow("pending rewards"))?;
        }

        Ok(OwnerSummary {
            owner,
            total_locked: aggregate.total_locked,
            total_rewards_paid: aggregate.total_rewards_paid,
            pending_rewards,
            positions,
            as_of: now,
        })
    }

    pub fn system_summary(&self) -> StakeResult<SystemAggregate> {
        self.store.system_aggregate()
    }

    /// Check conservation and that custody backs every locked unit.
    ///
    /// Custody is read while the store is read-locked, so no operation can be
    /// half-settled in between.
    pub fn reconcile(&self) -> StakeResult<Reconciliation> {
        let (system, custody_held) = self
            .store
            .with_verified(|system| (*system, self.custody.held()))?;

        let surplus = custody_held.checked_sub(system.total_locked).ok_or_else(|| {
            StakeError::invariant(format!(
                "custody holds {custody_held} but {} is locked",
                system.total_locked
            ))
        })?;

        Ok(Reconciliation {
            system,
            custody_held,
            surplus,
        })
    }
}
