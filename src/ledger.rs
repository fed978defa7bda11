use std::collections::{HashMap, HashSet};

use log::debug;

use crate::Address;
use crate::amount::Amount;
use crate::engine::{Payout, TransferRejected};

// Credits payouts to in-memory balances. Used by the replay binary and tests;
// a real deployment would put a wallet or bank rail behind `Payout` instead.
//
// Addresses can be marked as refusing funds to simulate a recipient that can
// not accept a transfer.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: HashMap<Address, Amount>,
    refusing: HashSet<Address>,
}

impl InMemoryLedger {
    pub fn balance(&self, address: &Address) -> Amount {
        self.balances.get(address).copied().unwrap_or_default()
    }

    pub fn refuse(&mut self, address: &Address) {
        self.refusing.insert(address.clone());
    }

    pub fn accept(&mut self, address: &Address) {
        self.refusing.remove(address);
    }

    pub fn balances(&self) -> impl Iterator<Item = (&Address, &Amount)> {
        self.balances.iter()
    }
}

impl Payout for InMemoryLedger {
    fn transfer(&mut self, to: &Address, amount: Amount) -> Result<(), TransferRejected> {
        if self.refusing.contains(to) {
            return Err(TransferRejected::Refused);
        }

        let balance = self.balances.entry(to.clone()).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or(TransferRejected::Overflow)?;
        debug!("[Ledger] {to} credited {amount}, balance {balance}");
        Ok(())
    }

    fn reverse(&mut self, to: &Address, amount: Amount) {
        if let Some(balance) = self.balances.get_mut(to) {
            // Only ever reverses a credit made in the same settlement, so the
            // balance always covers it.
            *balance = balance.checked_sub(amount).unwrap_or_default();
            debug!("[Ledger] {to} debited {amount}, balance {balance}");
        }
    }
}
