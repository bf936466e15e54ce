use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stakeledger_core::{Aggregate, AggregateRoot, Amount, OwnerId, PositionId, StakeError, StakeResult};
use stakeledger_events::Event;

use crate::accrual::{accrued_reward, tax_on};
use crate::config::StakingTerms;
use crate::custody::{Beneficiary, Transfer};

/// Aggregate root: one stake position.
///
/// Two states only: active, then closed for good. Principal only grows
/// (through reinvest) and the record is kept after close for history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    id: PositionId,
    owner: OwnerId,
    principal: Amount,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    last_accrual_time: DateTime<Utc>,
    active: bool,
    version: u64,
}

impl Position {
    /// Not-yet-opened record for `id`, to be fed an `Open` command.
    pub fn empty(id: PositionId, owner: OwnerId) -> Self {
        Self {
            id,
            owner,
            principal: 0,
            start_time: DateTime::<Utc>::default(),
            end_time: DateTime::<Utc>::default(),
            last_accrual_time: DateTime::<Utc>::default(),
            active: false,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> PositionId {
        self.id
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn principal(&self) -> Amount {
        self.principal
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn last_accrual_time(&self) -> DateTime<Utc> {
        self.last_accrual_time
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_opened(&self) -> bool {
        self.version > 0
    }

    pub fn is_unlocked(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    /// Reward accrued since the last settlement. Zero once closed.
    pub fn reward(&self, now: DateTime<Utc>, terms: &StakingTerms) -> StakeResult<Amount> {
        if !self.active {
            return Ok(0);
        }
        let elapsed = (now - self.last_accrual_time).num_seconds();
        accrued_reward(self.principal, elapsed, terms)
    }
}

impl AggregateRoot for Position {
    type Id = PositionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionAction {
    Open { amount: Amount },
    Close,
    Reinvest,
    Claim,
}

impl PositionAction {
    pub fn name(&self) -> &'static str {
        match self {
            PositionAction::Open { .. } => "open",
            PositionAction::Close => "close",
            PositionAction::Reinvest => "reinvest",
            PositionAction::Claim => "claim",
        }
    }
}

/// Command: an action evaluated under the terms in force at `occurred_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionCommand {
    pub action: PositionAction,
    pub terms: StakingTerms,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PositionOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOpened {
    pub owner: OwnerId,
    pub position_id: PositionId,
    pub amount: Amount,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Event: PositionClosed. `payout = principal + reward - tax`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionClosed {
    pub owner: OwnerId,
    pub position_id: PositionId,
    pub principal: Amount,
    pub reward: Amount,
    pub tax: Amount,
    pub payout: Amount,
    pub closed_at: DateTime<Utc>,
}

/// Event: PositionReinvested. `principal` is the new, compounded principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionReinvested {
    pub owner: OwnerId,
    pub position_id: PositionId,
    pub reward: Amount,
    pub principal: Amount,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Event: RewardClaimed. `payout = reward - tax`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardClaimed {
    pub owner: OwnerId,
    pub position_id: PositionId,
    pub reward: Amount,
    pub tax: Amount,
    pub payout: Amount,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeEvent {
    Opened(PositionOpened),
    Closed(PositionClosed),
    Reinvested(PositionReinvested),
    RewardClaimed(RewardClaimed),
}

impl Event for StakeEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StakeEvent::Opened(_) => "staking.position.opened",
            StakeEvent::Closed(_) => "staking.position.closed",
            StakeEvent::Reinvested(_) => "staking.position.reinvested",
            StakeEvent::RewardClaimed(_) => "staking.position.reward_claimed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StakeEvent::Opened(e) => e.start_time,
            StakeEvent::Closed(e) => e.closed_at,
            StakeEvent::Reinvested(e) => e.start_time,
            StakeEvent::RewardClaimed(e) => e.claimed_at,
        }
    }
}

/// Change to the locked total caused by one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedDelta {
    Increase(Amount),
    Decrease(Amount),
}

impl StakeEvent {
    pub fn owner(&self) -> OwnerId {
        match self {
            StakeEvent::Opened(e) => e.owner,
            StakeEvent::Closed(e) => e.owner,
            StakeEvent::Reinvested(e) => e.owner,
            StakeEvent::RewardClaimed(e) => e.owner,
        }
    }

    pub fn position_id(&self) -> PositionId {
        match self {
            StakeEvent::Opened(e) => e.position_id,
            StakeEvent::Closed(e) => e.position_id,
            StakeEvent::Reinvested(e) => e.position_id,
            StakeEvent::RewardClaimed(e) => e.position_id,
        }
    }

    pub fn locked_delta(&self) -> LockedDelta {
        match self {
            StakeEvent::Opened(e) => LockedDelta::Increase(e.amount),
            StakeEvent::Closed(e) => LockedDelta::Decrease(e.principal),
            StakeEvent::Reinvested(e) => LockedDelta::Increase(e.reward),
            StakeEvent::RewardClaimed(_) => LockedDelta::Increase(0),
        }
    }

    /// Reward settled out to the owner (claims and closes only).
    pub fn reward_paid(&self) -> Amount {
        match self {
            StakeEvent::Closed(e) => e.reward,
            StakeEvent::RewardClaimed(e) => e.reward,
            StakeEvent::Opened(_) | StakeEvent::Reinvested(_) => 0,
        }
    }

    /// Value movement this event requires, in settlement order.
    /// Treasury first; zero-amount legs are omitted.
    pub fn transfers(&self) -> Vec<Transfer> {
        let (tax, payout) = match self {
            StakeEvent::Opened(e) => {
                return vec![Transfer::In {
                    from: e.owner,
                    amount: e.amount,
                }];
            }
            StakeEvent::Reinvested(_) => return Vec::new(),
            StakeEvent::Closed(e) => (e.tax, e.payout),
            StakeEvent::RewardClaimed(e) => (e.tax, e.payout),
        };

        let mut transfers = Vec::with_capacity(2);
        if tax > 0 {
            transfers.push(Transfer::Out {
                to: Beneficiary::Treasury,
                amount: tax,
            });
        }
        if payout > 0 {
            transfers.push(Transfer::Out {
                to: Beneficiary::Owner(self.owner()),
                amount: payout,
            });
        }
        transfers
    }
}

impl Aggregate for Position {
    type Command = PositionCommand;
    type Event = StakeEvent;
    type Error = StakeError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StakeEvent::Opened(e) => {
                self.id = e.position_id;
                self.owner = e.owner;
                self.principal = e.amount;
                self.start_time = e.start_time;
                self.end_time = e.end_time;
                self.last_accrual_time = e.start_time;
                self.active = true;
            }
            StakeEvent::Closed(e) => {
                self.last_accrual_time = e.closed_at;
                self.active = false;
            }
            StakeEvent::Reinvested(e) => {
                self.principal = e.principal;
                self.start_time = e.start_time;
                self.end_time = e.end_time;
                self.last_accrual_time = e.start_time;
            }
            StakeEvent::RewardClaimed(e) => {
                self.last_accrual_time = e.claimed_at;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let now = command.occurred_at;
        let terms = &command.terms;
        let event = match command.action {
            PositionAction::Open { amount } => self.handle_open(amount, now, terms)?,
            PositionAction::Close => self.handle_close(now, terms)?,
            PositionAction::Reinvest => self.handle_reinvest(now, terms)?,
            PositionAction::Claim => self.handle_claim(now, terms)?,
        };
        Ok(vec![event])
    }
}

impl Position {
    fn ensure_active(&self) -> StakeResult<()> {
        if !self.is_opened() {
            return Err(StakeError::NotFound(self.id));
        }
        if !self.active {
            return Err(StakeError::NotActive(self.id));
        }
        Ok(())
    }

    fn ensure_unlocked(&self, now: DateTime<Utc>) -> StakeResult<()> {
        if !self.is_unlocked(now) {
            return Err(StakeError::LockNotElapsed {
                position_id: self.id,
                unlocks_at: self.end_time,
            });
        }
        Ok(())
    }

    fn lock_until(now: DateTime<Utc>, terms: &StakingTerms) -> StakeResult<DateTime<Utc>> {
        now.checked_add_signed(terms.lock_period)
            .ok_or(StakeError::ArithmeticOverflow("lock end"))
    }

    fn handle_open(&self, amount: Amount, now: DateTime<Utc>, terms: &StakingTerms) -> StakeResult<StakeEvent> {
        if self.is_opened() {
            return Err(StakeError::invariant(format!("position {} already exists", self.id)));
        }
        if amount < terms.min_stake {
            return Err(StakeError::BelowMinimum {
                amount,
                minimum: terms.min_stake,
            });
        }

        Ok(StakeEvent::Opened(PositionOpened {
            owner: self.owner,
            position_id: self.id,
            amount,
            start_time: now,
            end_time: Self::lock_until(now, terms)?,
        }))
    }

    fn handle_close(&self, now: DateTime<Utc>, terms: &StakingTerms) -> StakeResult<StakeEvent> {
        self.ensure_active()?;
        self.ensure_unlocked(now)?;

        let reward = self.reward(now, terms)?;
        let gross = self
            .principal
            .checked_add(reward)
            .ok_or(StakeError::ArithmeticOverflow("close gross"))?;
        // Tax applies to the whole withdrawal, principal included.
        let tax = tax_on(gross, terms)?;

        Ok(StakeEvent::Closed(PositionClosed {
            owner: self.owner,
            position_id: self.id,
            principal: self.principal,
            reward,
            tax,
            payout: gross - tax,
            closed_at: now,
        }))
    }

    fn handle_reinvest(&self, now: DateTime<Utc>, terms: &StakingTerms) -> StakeResult<StakeEvent> {
        self.ensure_active()?;
        self.ensure_unlocked(now)?;

        let reward = self.reward(now, terms)?;
        let principal = self
            .principal
            .checked_add(reward)
            .ok_or(StakeError::ArithmeticOverflow("reinvest principal"))?;

        Ok(StakeEvent::Reinvested(PositionReinvested {
            owner: self.owner,
            position_id: self.id,
            reward,
            principal,
            start_time: now,
            end_time: Self::lock_until(now, terms)?,
        }))
    }

    fn handle_claim(&self, now: DateTime<Utc>, terms: &StakingTerms) -> StakeResult<StakeEvent> {
        self.ensure_active()?;

        let reward = self.reward(now, terms)?;
        if reward == 0 {
            return Err(StakeError::NothingToClaim(self.id));
        }
        let tax = tax_on(reward, terms)?;

        Ok(StakeEvent::RewardClaimed(RewardClaimed {
            owner: self.owner,
            position_id: self.id,
            reward,
            tax,
            payout: reward - tax,
            claimed_at: now,
        }))
    }
}
