//! Custody boundary: the external holder of value backing all positions.
//!
//! The engine only describes value movement as `Transfer`s. A `Custody`
//! implementation executes them and may reject them; any rejection aborts the
//! whole operation and the store rolls back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use stakeledger_core::{Amount, OwnerId, StakeError, StakeResult};

/// Receiving side of an outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Beneficiary {
    Owner(OwnerId),
    Treasury,
}

/// One value movement requested by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transfer {
    /// Owner wallet → custody.
    In { from: OwnerId, amount: Amount },
    /// Custody → beneficiary.
    Out { to: Beneficiary, amount: Amount },
}

pub trait Custody: Send + Sync {
    /// Pull `amount` from the owner into custody.
    ///
    /// Fails with `InsufficientFunds` when the owner cannot cover it.
    fn transfer_in(&self, from: OwnerId, amount: Amount) -> StakeResult<()>;

    /// Pay `amount` out of custody. Fails with `TransferFailed` when rejected.
    fn transfer_out(&self, to: Beneficiary, amount: Amount) -> StakeResult<()>;

    /// Value currently held in custody.
    fn held(&self) -> Amount;

    /// Execute a batch of transfers in order, all-or-nothing.
    ///
    /// On error no transfer of the batch may remain applied.
    fn settle(&self, transfers: &[Transfer]) -> StakeResult<()>;
}

impl<T> Custody for Arc<T>
where
    T: Custody + ?Sized,
{
    fn transfer_in(&self, from: OwnerId, amount: Amount) -> StakeResult<()> {
        (**self).transfer_in(from, amount)
    }

    fn transfer_out(&self, to: Beneficiary, amount: Amount) -> StakeResult<()> {
        (**self).transfer_out(to, amount)
    }

    fn held(&self) -> Amount {
        (**self).held()
    }

    fn settle(&self, transfers: &[Transfer]) -> StakeResult<()> {
        (**self).settle(transfers)
    }
}

#[derive(Debug, Default)]
struct Balances {
    wallets: HashMap<OwnerId, Amount>,
    held: Amount,
    treasury: Amount,
}

impl Balances {
    fn apply(&mut self, transfer: &Transfer) -> StakeResult<()> {
        match *transfer {
            Transfer::In { from, amount } => {
                let available = self.wallets.get(&from).copied().unwrap_or(0);
                if available < amount {
                    return Err(StakeError::InsufficientFunds {
                        requested: amount,
                        available,
                    });
                }
                let held = self
                    .held
                    .checked_add(amount)
                    .ok_or(StakeError::ArithmeticOverflow("custody balance"))?;
                self.wallets.insert(from, available - amount);
                self.held = held;
            }
            Transfer::Out { to, amount } => {
                if self.held < amount {
                    return Err(StakeError::transfer_failed(format!(
                        "custody holds {}, cannot pay {amount}",
                        self.held
                    )));
                }
                let credited = match to {
                    Beneficiary::Owner(owner) => self.wallets.entry(owner).or_insert(0),
                    Beneficiary::Treasury => &mut self.treasury,
                };
                *credited = credited
                    .checked_add(amount)
                    .ok_or(StakeError::ArithmeticOverflow("beneficiary balance"))?;
                self.held -= amount;
            }
        }
        Ok(())
    }

    /// Inverse of a successful `apply`.
    fn revert(&mut self, transfer: &Transfer) {
        match *transfer {
            Transfer::In { from, amount } => {
                *self.wallets.entry(from).or_insert(0) += amount;
                self.held -= amount;
            }
            Transfer::Out { to, amount } => {
                match to {
                    Beneficiary::Owner(owner) => {
                        if let Some(wallet) = self.wallets.get_mut(&owner) {
                            *wallet -= amount;
                        }
                    }
                    Beneficiary::Treasury => self.treasury -= amount,
                }
                self.held += amount;
            }
        }
    }
}

/// In-process custody with per-owner wallets, a custody pool and a treasury.
///
/// Batches settle atomically: a failing transfer reverts the ones before it.
#[derive(Debug, Default)]
pub struct InMemoryCustody {
    balances: Mutex<Balances>,
}

impl InMemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    fn balances(&self) -> MutexGuard<'_, Balances> {
        self.balances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Credit an owner's wallet (outside any staking operation).
    pub fn deposit(&self, owner: OwnerId, amount: Amount) -> StakeResult<()> {
        let mut balances = self.balances();
        let wallet = balances.wallets.entry(owner).or_insert(0);
        *wallet = wallet
            .checked_add(amount)
            .ok_or(StakeError::ArithmeticOverflow("wallet balance"))?;
        Ok(())
    }

    /// Top up the custody pool that rewards are paid from.
    pub fn fund_rewards(&self, amount: Amount) -> StakeResult<()> {
        let mut balances = self.balances();
        balances.held = balances
            .held
            .checked_add(amount)
            .ok_or(StakeError::ArithmeticOverflow("custody balance"))?;
        Ok(())
    }

    pub fn wallet(&self, owner: OwnerId) -> Amount {
        self.balances().wallets.get(&owner).copied().unwrap_or(0)
    }

    pub fn treasury(&self) -> Amount {
        self.balances().treasury
    }
}

impl Custody for InMemoryCustody {
    fn transfer_in(&self, from: OwnerId, amount: Amount) -> StakeResult<()> {
        self.settle(&[Transfer::In { from, amount }])
    }

    fn transfer_out(&self, to: Beneficiary, amount: Amount) -> StakeResult<()> {
        self.settle(&[Transfer::Out { to, amount }])
    }

    fn held(&self) -> Amount {
        self.balances().held
    }

    fn settle(&self, transfers: &[Transfer]) -> StakeResult<()> {
        let mut balances = self.balances();
        for (idx, transfer) in transfers.iter().enumerate() {
            if let Err(err) = balances.apply(transfer) {
                for done in transfers[..idx].iter().rev() {
                    balances.revert(done);
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_in_moves_wallet_into_custody() {
        let custody = InMemoryCustody::new();
        let owner = OwnerId::new();
        custody.deposit(owner, 500).unwrap();

        custody.transfer_in(owner, 200).unwrap();
        assert_eq!(custody.wallet(owner), 300);
        assert_eq!(custody.held(), 200);
    }

    #[test]
    fn transfer_in_without_funds_is_insufficient() {
        let custody = InMemoryCustody::new();
        let owner = OwnerId::new();
        custody.deposit(owner, 50).unwrap();

        let err = custody.transfer_in(owner, 51).unwrap_err();
        assert_eq!(
            err,
            StakeError::InsufficientFunds {
                requested: 51,
                available: 50
            }
        );
        assert_eq!(custody.wallet(owner), 50);
        assert_eq!(custody.held(), 0);
    }

    #[test]
    fn failed_batch_reverts_earlier_transfers() {
        let custody = InMemoryCustody::new();
        let owner = OwnerId::new();
        custody.fund_rewards(100).unwrap();

        let err = custody
            .settle(&[
                Transfer::Out { to: Beneficiary::Treasury, amount: 60 },
                Transfer::Out { to: Beneficiary::Owner(owner), amount: 60 },
            ])
            .unwrap_err();

        assert!(matches!(err, StakeError::TransferFailed(_)));
        assert_eq!(custody.treasury(), 0);
        assert_eq!(custody.wallet(owner), 0);
        assert_eq!(custody.held(), 100);
    }

    #[test]
    fn batch_settles_in_order() {
        let custody = InMemoryCustody::new();
        let owner = OwnerId::new();
        custody.deposit(owner, 1_000).unwrap();

        custody
            .settle(&[
                Transfer::In { from: owner, amount: 1_000 },
                Transfer::Out { to: Beneficiary::Treasury, amount: 5 },
                Transfer::Out { to: Beneficiary::Owner(owner), amount: 995 },
            ])
            .unwrap();

        assert_eq!(custody.treasury(), 5);
        assert_eq!(custody.wallet(owner), 995);
        assert_eq!(custody.held(), 0);
    }

    #[test]
    fn funding_past_capacity_overflows_without_change() {
        let custody = InMemoryCustody::new();
        let owner = OwnerId::new();
        custody.fund_rewards(Amount::MAX).unwrap();
        custody.deposit(owner, Amount::MAX).unwrap();

        assert_eq!(
            custody.fund_rewards(1),
            Err(StakeError::ArithmeticOverflow("custody balance"))
        );
        assert_eq!(
            custody.deposit(owner, 1),
            Err(StakeError::ArithmeticOverflow("wallet balance"))
        );
        assert_eq!(custody.held(), Amount::MAX);
        assert_eq!(custody.wallet(owner), Amount::MAX);
    }
}
