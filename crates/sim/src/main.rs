//! Replays the reference stake lifecycles against in-memory collaborators and
//! logs every ledger event as JSON.
//!
//! Terms come from `STAKELEDGER_*` env vars (defaults: 10% APY, 30-day lock,
//! 0.5% exit tax, 1-token minimum at 6 decimals).

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};

use stakeledger_core::{Amount, OwnerId};
use stakeledger_events::{EventBus, EventEnvelope, InMemoryEventBus};
use stakeledger_staking::{
    Clock, InMemoryCustody, ManualClock, PositionStore, StakeEvent, StakingConfig, StakingEngine,
};

const TOKEN: Amount = 1_000_000;

type SimEngine = StakingEngine<
    Arc<InMemoryCustody>,
    Arc<ManualClock>,
    Arc<InMemoryEventBus<EventEnvelope<StakeEvent>>>,
>;

fn main() -> Result<()> {
    stakeledger_observability::init();

    let config = StakingConfig::from_env().context("loading staking config")?;
    tracing::info!(config = ?config, "starting simulation");

    let lock = Duration::seconds(config.lock_period_secs);
    let custody = Arc::new(InMemoryCustody::new());
    custody.fund_rewards(1_000 * TOKEN)?;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let bus: Arc<InMemoryEventBus<EventEnvelope<StakeEvent>>> = Arc::new(InMemoryEventBus::new());
    let audit = bus.subscribe();

    let engine: SimEngine = StakingEngine::new(
        &config,
        Arc::new(PositionStore::new()),
        custody.clone(),
        clock.clone(),
        bus,
    )
    .context("building engine")?;

    let start = clock.now();
    let stake = 1_000 * TOKEN;

    // Close after one lock period.
    let alice = OwnerId::new();
    custody.deposit(alice, stake)?;
    let a = engine.open(alice, stake).context("alice open")?.position_id();

    // Reinvest after one period, close after the second.
    let bob = OwnerId::new();
    custody.deposit(bob, stake)?;
    let b = engine.open(bob, stake).context("bob open")?.position_id();

    // Claim halfway through the lock.
    let carol = OwnerId::new();
    custody.deposit(carol, stake)?;
    let c = engine.open(carol, stake).context("carol open")?.position_id();

    clock.advance_to(start + lock / 2);
    engine.claim(carol, c).context("carol claim")?;

    clock.advance_to(start + lock);
    engine.close(alice, a).context("alice close")?;
    engine.reinvest(bob, b).context("bob reinvest")?;

    clock.advance_to(start + lock * 2);
    engine.close(bob, b).context("bob close")?;

    for envelope in audit.drain() {
        let json = serde_json::to_string(&envelope).context("encoding ledger event")?;
        tracing::info!(sequence = envelope.sequence_number(), event = %json, "ledger event");
    }

    for (name, owner) in [("alice", alice), ("bob", bob), ("carol", carol)] {
        let summary = engine.owner_summary(owner).context("owner summary")?;
        tracing::info!(
            owner = name,
            wallet = %custody.wallet(owner),
            locked = %summary.total_locked,
            rewards_paid = %summary.total_rewards_paid,
            pending = %summary.pending_rewards,
            "owner balance"
        );
    }

    let report = engine.reconcile().context("reconciling custody")?;
    tracing::info!(
        total_locked = %report.system.total_locked,
        custody_held = %report.custody_held,
        reserve = %report.surplus,
        treasury = %custody.treasury(),
        "reconciled"
    );

    Ok(())
}
