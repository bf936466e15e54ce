//! Position store: the single owner of every position record and aggregate.
//!
//! Layout is an arena (`Vec<Position>` indexed by `position_id - 1`) plus an
//! owner index. One `RwLock` guards everything, so the write path is the one
//! serialisation point for positions, owner totals, system totals and the
//! event journal.
//!
//! Mutations are transactional:
//!
//! ```text
//! write lock
//!   ↓
//! 1. decide   (pure, from the current record; may fail, nothing touched yet)
//!   ↓
//! 2. apply    (record + owner aggregate + system aggregate + journal)
//!   ↓
//! 3. settle   (external transfer, lock still held)
//!   ↓        └─ failure → restore checkpoint, return error
//! unlock
//! ```

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stakeledger_core::{Aggregate, AggregateRoot, Amount, OwnerId, PositionId, StakeError, StakeResult};
use stakeledger_events::EventEnvelope;

use crate::position::{LockedDelta, Position, PositionOpened, StakeEvent};

/// Per-owner totals, maintained incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerAggregate {
    /// Sum of principal over the owner's active positions.
    pub total_locked: Amount,
    /// Rewards settled to this owner by claims and closes.
    pub total_rewards_paid: Amount,
    /// Every position ever opened by the owner, in creation order.
    pub position_ids: Vec<PositionId>,
}

/// Process-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAggregate {
    /// Sum of principal over all active positions.
    pub total_locked: Amount,
    /// Cumulative rewards settled by claims and closes. Never decreases.
    pub total_rewards_paid: Amount,
    /// Last issued position id (0 before the first open).
    pub position_counter: u64,
    pub active_positions: u64,
}

fn apply_locked(total: Amount, delta: LockedDelta) -> StakeResult<Amount> {
    match delta {
        LockedDelta::Increase(v) => total
            .checked_add(v)
            .ok_or(StakeError::ArithmeticOverflow("total locked")),
        LockedDelta::Decrease(v) => total
            .checked_sub(v)
            .ok_or_else(|| StakeError::invariant("total locked would go negative")),
    }
}

impl OwnerAggregate {
    fn record(&mut self, event: &StakeEvent) -> StakeResult<()> {
        self.total_locked = apply_locked(self.total_locked, event.locked_delta())?;
        self.total_rewards_paid = self
            .total_rewards_paid
            .checked_add(event.reward_paid())
            .ok_or(StakeError::ArithmeticOverflow("owner rewards paid"))?;
        if let StakeEvent::Opened(e) = event {
            self.position_ids.push(e.position_id);
        }
        Ok(())
    }
}

impl SystemAggregate {
    fn record(&mut self, event: &StakeEvent) -> StakeResult<()> {
        self.total_locked = apply_locked(self.total_locked, event.locked_delta())?;
        self.total_rewards_paid = self
            .total_rewards_paid
            .checked_add(event.reward_paid())
            .ok_or(StakeError::ArithmeticOverflow("system rewards paid"))?;
        match event {
            StakeEvent::Opened(e) => {
                self.position_counter = e.position_id.get();
                self.active_positions += 1;
            }
            StakeEvent::Closed(_) => {
                self.active_positions = self
                    .active_positions
                    .checked_sub(1)
                    .ok_or_else(|| StakeError::invariant("active position count would go negative"))?;
            }
            StakeEvent::Reinvested(_) | StakeEvent::RewardClaimed(_) => {}
        }
        Ok(())
    }

    fn next_position_id(&self) -> StakeResult<PositionId> {
        self.position_counter
            .checked_add(1)
            .map(PositionId::new)
            .ok_or(StakeError::ArithmeticOverflow("position counter"))
    }
}

/// Everything needed to undo one transaction.
#[derive(Debug)]
struct Checkpoint {
    arena_len: usize,
    record: Option<(usize, Position)>,
    owner: OwnerId,
    owner_before: Option<(Amount, Amount, usize)>,
    system: SystemAggregate,
    journal_len: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    positions: Vec<Position>,
    owners: HashMap<OwnerId, OwnerAggregate>,
    system: SystemAggregate,
    journal: Vec<EventEnvelope<StakeEvent>>,
}

impl LedgerState {
    fn lookup(&self, owner: OwnerId, id: PositionId) -> StakeResult<&Position> {
        id.slot()
            .and_then(|slot| self.positions.get(slot))
            .filter(|p| p.owner() == owner)
            .ok_or(StakeError::NotFound(id))
    }

    fn checkpoint(&self, owner: OwnerId, id: PositionId) -> Checkpoint {
        let record = id
            .slot()
            .and_then(|slot| self.positions.get(slot).map(|p| (slot, p.clone())));
        let owner_before = self
            .owners
            .get(&owner)
            .map(|o| (o.total_locked, o.total_rewards_paid, o.position_ids.len()));

        Checkpoint {
            arena_len: self.positions.len(),
            record,
            owner,
            owner_before,
            system: self.system,
            journal_len: self.journal.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.positions.truncate(checkpoint.arena_len);
        if let Some((slot, position)) = checkpoint.record {
            self.positions[slot] = position;
        }
        match checkpoint.owner_before {
            Some((locked, paid, ids_len)) => {
                if let Some(agg) = self.owners.get_mut(&checkpoint.owner) {
                    agg.total_locked = locked;
                    agg.total_rewards_paid = paid;
                    agg.position_ids.truncate(ids_len);
                }
            }
            None => {
                self.owners.remove(&checkpoint.owner);
            }
        }
        self.system = checkpoint.system;
        self.journal.truncate(checkpoint.journal_len);
    }

    /// Apply decided events to records, aggregates and journal.
    ///
    /// May leave partial state behind on error; callers restore a checkpoint.
    fn commit(&mut self, owner: OwnerId, events: Vec<StakeEvent>) -> StakeResult<Vec<EventEnvelope<StakeEvent>>> {
        let mut committed = Vec::with_capacity(events.len());

        for event in events {
            if event.owner() != owner {
                return Err(StakeError::invariant(format!(
                    "event for position {} names a different owner",
                    event.position_id()
                )));
            }

            let id = event.position_id();
            match &event {
                StakeEvent::Opened(_) => {
                    if id != self.system.next_position_id()? || id.slot() != Some(self.positions.len()) {
                        return Err(StakeError::invariant(format!(
                            "position id {id} is out of sequence"
                        )));
                    }
                    let mut position = Position::empty(id, owner);
                    position.apply(&event);
                    self.positions.push(position);
                }
                _ => {
                    let slot = id.slot().ok_or(StakeError::NotFound(id))?;
                    let position = self
                        .positions
                        .get_mut(slot)
                        .filter(|p| p.owner() == owner)
                        .ok_or(StakeError::NotFound(id))?;
                    position.apply(&event);
                }
            }

            self.owners.entry(owner).or_default().record(&event)?;
            self.system.record(&event)?;

            let envelope = EventEnvelope::new(
                Uuid::now_v7(),
                owner,
                id,
                self.journal.len() as u64 + 1,
                event,
            );
            self.journal.push(envelope.clone());
            committed.push(envelope);
        }

        Ok(committed)
    }

    fn verify(&self) -> StakeResult<()> {
        let mut per_owner: HashMap<OwnerId, Amount> = HashMap::new();
        let mut total: Amount = 0;
        let mut active: u64 = 0;

        for position in self.positions.iter().filter(|p| p.is_active()) {
            *per_owner.entry(position.owner()).or_insert(0) += position.principal();
            total += position.principal();
            active += 1;
        }

        if total != self.system.total_locked {
            return Err(StakeError::invariant(format!(
                "system total_locked is {}, active principal sums to {total}",
                self.system.total_locked
            )));
        }
        if active != self.system.active_positions {
            return Err(StakeError::invariant(format!(
                "system counts {} active positions, found {active}",
                self.system.active_positions
            )));
        }
        for (owner, agg) in &self.owners {
            let expected = per_owner.get(owner).copied().unwrap_or(0);
            if agg.total_locked != expected {
                return Err(StakeError::invariant(format!(
                    "owner {owner} total_locked is {}, active principal sums to {expected}",
                    agg.total_locked
                )));
            }
        }
        Ok(())
    }
}

enum Target {
    New,
    Existing(PositionId),
}

/// Thread-safe position store.
#[derive(Debug, Default)]
pub struct PositionStore {
    state: RwLock<LedgerState>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StakeResult<RwLockReadGuard<'_, LedgerState>> {
        self.state.read().map_err(|_| StakeError::StorePoisoned)
    }

    fn write(&self) -> StakeResult<RwLockWriteGuard<'_, LedgerState>> {
        self.state.write().map_err(|_| StakeError::StorePoisoned)
    }

    /// Open a position directly, with no validation or settlement.
    pub fn create_position(
        &self,
        owner: OwnerId,
        principal: Amount,
        now: DateTime<Utc>,
        lock_period: Duration,
    ) -> StakeResult<PositionId> {
        let committed = self.open_with(
            owner,
            |position| {
                let end_time = now
                    .checked_add_signed(lock_period)
                    .ok_or(StakeError::ArithmeticOverflow("lock end"))?;
                Ok(vec![StakeEvent::Opened(PositionOpened {
                    owner,
                    position_id: *position.id(),
                    amount: principal,
                    start_time: now,
                    end_time,
                })])
            },
            |_| Ok(()),
        )?;
        committed
            .first()
            .map(|e| e.position_id())
            .ok_or_else(|| StakeError::invariant("open committed no event"))
    }

    pub fn get(&self, owner: OwnerId, id: PositionId) -> StakeResult<Position> {
        self.read()?.lookup(owner, id).cloned()
    }

    /// Atomic read-modify-write of one position, with no settlement step.
    pub fn mutate<D>(&self, owner: OwnerId, id: PositionId, decide: D) -> StakeResult<Vec<EventEnvelope<StakeEvent>>>
    where
        D: FnOnce(&Position) -> StakeResult<Vec<StakeEvent>>,
    {
        self.mutate_with(owner, id, decide, |_| Ok(()))
    }

    /// Open the next position for `owner`.
    ///
    /// `decide` receives an empty record carrying the id that will be issued.
    pub fn open_with<D, S>(&self, owner: OwnerId, decide: D, settle: S) -> StakeResult<Vec<EventEnvelope<StakeEvent>>>
    where
        D: FnOnce(&Position) -> StakeResult<Vec<StakeEvent>>,
        S: FnOnce(&[StakeEvent]) -> StakeResult<()>,
    {
        self.transact(owner, Target::New, decide, settle)
    }

    /// Mutate an existing position of `owner`.
    pub fn mutate_with<D, S>(
        &self,
        owner: OwnerId,
        id: PositionId,
        decide: D,
        settle: S,
    ) -> StakeResult<Vec<EventEnvelope<StakeEvent>>>
    where
        D: FnOnce(&Position) -> StakeResult<Vec<StakeEvent>>,
        S: FnOnce(&[StakeEvent]) -> StakeResult<()>,
    {
        self.transact(owner, Target::Existing(id), decide, settle)
    }

    fn transact<D, S>(&self, owner: OwnerId, target: Target, decide: D, settle: S) -> StakeResult<Vec<EventEnvelope<StakeEvent>>>
    where
        D: FnOnce(&Position) -> StakeResult<Vec<StakeEvent>>,
        S: FnOnce(&[StakeEvent]) -> StakeResult<()>,
    {
        let mut state = self.write()?;

        let current = match target {
            Target::New => Position::empty(state.system.next_position_id()?, owner),
            Target::Existing(id) => state.lookup(owner, id)?.clone(),
        };

        let events = decide(&current)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let checkpoint = state.checkpoint(owner, *current.id());
        let committed = match state.commit(owner, events) {
            Ok(committed) => committed,
            Err(err) => {
                state.restore(checkpoint);
                return Err(err);
            }
        };

        let applied: Vec<StakeEvent> = committed.iter().map(|e| e.payload().clone()).collect();
        if let Err(err) = settle(&applied) {
            tracing::warn!(
                owner = %owner,
                position_id = %current.id(),
                error = %err,
                "settlement failed; rolling back position store"
            );
            state.restore(checkpoint);
            return Err(err);
        }

        Ok(committed)
    }

    pub fn list_positions(&self, owner: OwnerId) -> StakeResult<Vec<PositionId>> {
        Ok(self
            .read()?
            .owners
            .get(&owner)
            .map(|o| o.position_ids.clone())
            .unwrap_or_default())
    }

    /// Full records of the owner's positions, in creation order.
    pub fn positions_of(&self, owner: OwnerId) -> StakeResult<Vec<Position>> {
        let state = self.read()?;
        let Some(agg) = state.owners.get(&owner) else {
            return Ok(Vec::new());
        };
        agg.position_ids
            .iter()
            .map(|id| state.lookup(owner, *id).cloned())
            .collect()
    }

    pub fn owner_aggregate(&self, owner: OwnerId) -> StakeResult<OwnerAggregate> {
        Ok(self.read()?.owners.get(&owner).cloned().unwrap_or_default())
    }

    pub fn system_aggregate(&self) -> StakeResult<SystemAggregate> {
        Ok(self.read()?.system)
    }

    /// The whole journal, in commit order.
    pub fn events(&self) -> StakeResult<Vec<EventEnvelope<StakeEvent>>> {
        Ok(self.read()?.journal.clone())
    }

    /// Journal entries for one position, in commit order.
    pub fn events_for(&self, owner: OwnerId, id: PositionId) -> StakeResult<Vec<EventEnvelope<StakeEvent>>> {
        Ok(self
            .read()?
            .journal
            .iter()
            .filter(|e| e.owner() == owner && e.position_id() == id)
            .cloned()
            .collect())
    }

    /// Recompute totals from the records and compare with the aggregates.
    pub fn verify_conservation(&self) -> StakeResult<SystemAggregate> {
        self.with_verified(|system| *system)
    }

    /// Verify conservation and run `f` while no mutation can start.
    pub fn with_verified<R>(&self, f: impl FnOnce(&SystemAggregate) -> R) -> StakeResult<R> {
        let state = self.read()?;
        state.verify()?;
        Ok(f(&state.system))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StakingTerms;
    use crate::position::{PositionAction, PositionCommand};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::default() + Duration::days(20_000)
    }

    fn lock() -> Duration {
        StakingTerms::default().lock_period
    }

    fn decide(action: PositionAction, at: DateTime<Utc>) -> impl FnOnce(&Position) -> StakeResult<Vec<StakeEvent>> {
        move |position: &Position| {
            position.handle(&PositionCommand {
                action,
                terms: StakingTerms::default(),
                occurred_at: at,
            })
        }
    }

    #[test]
    fn ids_are_global_and_sequential() {
        let store = PositionStore::new();
        let alice = OwnerId::new();
        let bob = OwnerId::new();

        let a1 = store.create_position(alice, 100, t0(), lock()).unwrap();
        let b1 = store.create_position(bob, 200, t0(), lock()).unwrap();
        let a2 = store.create_position(alice, 300, t0(), lock()).unwrap();

        assert_eq!((a1.get(), b1.get(), a2.get()), (1, 2, 3));
        assert_eq!(store.list_positions(alice).unwrap(), vec![a1, a2]);
        assert_eq!(store.list_positions(bob).unwrap(), vec![b1]);
        assert_eq!(store.system_aggregate().unwrap().position_counter, 3);
        assert_eq!(store.owner_aggregate(alice).unwrap().total_locked, 400);
        assert_eq!(store.system_aggregate().unwrap().total_locked, 600);
    }

    #[test]
    fn foreign_and_unknown_ids_are_not_found() {
        let store = PositionStore::new();
        let alice = OwnerId::new();
        let id = store.create_position(alice, 100, t0(), lock()).unwrap();

        assert_eq!(store.get(OwnerId::new(), id), Err(StakeError::NotFound(id)));
        assert_eq!(
            store.get(alice, PositionId::new(0)),
            Err(StakeError::NotFound(PositionId::new(0)))
        );
        assert_eq!(
            store.get(alice, PositionId::new(99)),
            Err(StakeError::NotFound(PositionId::new(99)))
        );
        assert!(store.list_positions(OwnerId::new()).unwrap().is_empty());
    }

    #[test]
    fn mutate_updates_record_and_aggregates_together() {
        let store = PositionStore::new();
        let owner = OwnerId::new();
        let id = store.create_position(owner, 1_000_000_000, t0(), lock()).unwrap();

        let at = t0() + Duration::days(30);
        let committed = store.mutate(owner, id, decide(PositionAction::Close, at)).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence_number(), 2);

        let position = store.get(owner, id).unwrap();
        assert!(!position.is_active());
        assert_eq!(position.version(), 2);

        let system = store.system_aggregate().unwrap();
        assert_eq!(system.total_locked, 0);
        assert_eq!(system.active_positions, 0);
        assert_eq!(system.total_rewards_paid, 8_219_178);
        assert_eq!(store.owner_aggregate(owner).unwrap().total_rewards_paid, 8_219_178);
        store.verify_conservation().unwrap();
    }

    #[test]
    fn failed_decision_leaves_store_untouched() {
        let store = PositionStore::new();
        let owner = OwnerId::new();
        let id = store.create_position(owner, 1_000_000_000, t0(), lock()).unwrap();
        let before = store.get(owner, id).unwrap();

        let err = store
            .mutate(owner, id, decide(PositionAction::Close, t0() + Duration::days(1)))
            .unwrap_err();
        assert!(matches!(err, StakeError::LockNotElapsed { .. }));
        assert_eq!(store.get(owner, id).unwrap(), before);
        assert_eq!(store.events().unwrap().len(), 1);
    }

    #[test]
    fn failed_settlement_rolls_back_open() {
        let store = PositionStore::new();
        let owner = OwnerId::new();

        let err = store
            .open_with(owner, decide(PositionAction::Open { amount: 5_000_000 }, t0()), |_| {
                Err(StakeError::transfer_failed("rejected"))
            })
            .unwrap_err();

        assert_eq!(err, StakeError::transfer_failed("rejected"));
        assert_eq!(store.system_aggregate().unwrap(), SystemAggregate::default());
        assert!(store.list_positions(owner).unwrap().is_empty());
        assert!(store.events().unwrap().is_empty());

        // The id that was never committed is issued to the next open.
        let id = store.create_position(owner, 5_000_000, t0(), lock()).unwrap();
        assert_eq!(id.get(), 1);
    }

    #[test]
    fn failed_settlement_rolls_back_close() {
        let store = PositionStore::new();
        let owner = OwnerId::new();
        let id = store.create_position(owner, 1_000_000_000, t0(), lock()).unwrap();
        let before = store.get(owner, id).unwrap();
        let aggregate_before = store.owner_aggregate(owner).unwrap();

        let err = store
            .mutate_with(owner, id, decide(PositionAction::Close, t0() + Duration::days(30)), |_| {
                Err(StakeError::transfer_failed("custody empty"))
            })
            .unwrap_err();

        assert!(matches!(err, StakeError::TransferFailed(_)));
        assert_eq!(store.get(owner, id).unwrap(), before);
        assert_eq!(store.owner_aggregate(owner).unwrap(), aggregate_before);
        assert_eq!(store.system_aggregate().unwrap().total_locked, 1_000_000_000);
        assert_eq!(store.events().unwrap().len(), 1);
        store.verify_conservation().unwrap();
    }

    #[test]
    fn events_for_filters_by_position() {
        let store = PositionStore::new();
        let owner = OwnerId::new();
        let first = store.create_position(owner, 1_000_000_000, t0(), lock()).unwrap();
        let second = store.create_position(owner, 1_000_000_000, t0(), lock()).unwrap();
        store
            .mutate(owner, first, decide(PositionAction::Claim, t0() + Duration::days(3)))
            .unwrap();

        let seqs: Vec<u64> = store
            .events_for(owner, first)
            .unwrap()
            .iter()
            .map(|e| e.sequence_number())
            .collect();
        assert_eq!(seqs, vec![1, 3]);
        assert_eq!(store.events_for(owner, second).unwrap().len(), 1);
        assert!(store.events_for(OwnerId::new(), first).unwrap().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open { owner: usize, amount: u64 },
        Close { owner: usize, pick: usize },
        Reinvest { owner: usize, pick: usize },
        Claim { owner: usize, pick: usize },
        Wait { days: i64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 1_000_000u64..10_000_000_000u64).prop_map(|(owner, amount)| Op::Open { owner, amount }),
            (0usize..3, 0usize..8).prop_map(|(owner, pick)| Op::Close { owner, pick }),
            (0usize..3, 0usize..8).prop_map(|(owner, pick)| Op::Reinvest { owner, pick }),
            (0usize..3, 0usize..8).prop_map(|(owner, pick)| Op::Claim { owner, pick }),
            (0i64..45).prop_map(|days| Op::Wait { days }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: whatever mix of operations succeeds or fails, the system
        /// total equals the principal of active positions.
        #[test]
        fn conservation_holds_for_any_sequence(ops in prop::collection::vec(op(), 1..40)) {
            let store = PositionStore::new();
            let owners = [OwnerId::new(), OwnerId::new(), OwnerId::new()];
            let mut now = t0();
            let mut rewards_paid_before = 0;

            for op in ops {
                let pick_id = |owner: usize, pick: usize| {
                    let ids = store.list_positions(owners[owner]).unwrap();
                    if ids.is_empty() { PositionId::new(0) } else { ids[pick % ids.len()] }
                };
                let _ = match op {
                    Op::Open { owner, amount } => store
                        .open_with(owners[owner], decide(PositionAction::Open { amount: amount as Amount }, now), |_| Ok(()))
                        .map(|_| ()),
                    Op::Close { owner, pick } => store
                        .mutate(owners[owner], pick_id(owner, pick), decide(PositionAction::Close, now))
                        .map(|_| ()),
                    Op::Reinvest { owner, pick } => store
                        .mutate(owners[owner], pick_id(owner, pick), decide(PositionAction::Reinvest, now))
                        .map(|_| ()),
                    Op::Claim { owner, pick } => store
                        .mutate(owners[owner], pick_id(owner, pick), decide(PositionAction::Claim, now))
                        .map(|_| ()),
                    Op::Wait { days } => {
                        now += Duration::days(days);
                        Ok(())
                    }
                };

                let system = store.verify_conservation().unwrap();
                prop_assert!(system.total_rewards_paid >= rewards_paid_before);
                rewards_paid_before = system.total_rewards_paid;
            }

            let owner_sum: Amount = owners
                .iter()
                .map(|o| store.owner_aggregate(*o).unwrap().total_locked)
                .sum();
            prop_assert_eq!(owner_sum, store.system_aggregate().unwrap().total_locked);
        }
    }
}
