use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use super::RentalError;
use crate::Address;
use crate::amount::Amount;

// Moves value out of the engine. Implementations talk to whatever actually
// holds funds; the engine only needs "pay this address" and a way to take a
// payment back when a later leg of the same settlement fails.
pub trait Payout {
    fn transfer(&mut self, to: &Address, amount: Amount) -> Result<(), TransferRejected>;

    /// Undoes a transfer that succeeded earlier in the same settlement.
    fn reverse(&mut self, to: &Address, amount: Amount);
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferRejected {
    #[error("recipient does not accept funds")]
    Refused,
    #[error("recipient balance would overflow")]
    Overflow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leg {
    Refund,
    OwnerPayment,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Transfer {
    pub leg: Leg,
    pub to: Address,
    pub amount: Amount,
}

// Refund first, then the owner. Zero legs are never sent.
pub(crate) fn plan(
    renter: &Address,
    refund: Amount,
    owner: &Address,
    owner_payment: Amount,
) -> Vec<Transfer> {
    [
        (Leg::Refund, renter, refund),
        (Leg::OwnerPayment, owner, owner_payment),
    ]
    .into_iter()
    .filter(|(_, _, amount)| !amount.is_zero())
    .map(|(leg, to, amount)| Transfer {
        leg,
        to: to.clone(),
        amount,
    })
    .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl EngineId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        EngineId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    // Engines currently paying out on this thread.
    static SETTLING: RefCell<Vec<EngineId>> = const { RefCell::new(Vec::new()) };
}

// Held for as long as payouts run. Any call back into the same engine from the
// payout (same thread) is refused instead of seeing, or deadlocking on, the
// settlement in flight.
pub(crate) struct ReentrancyGuard {
    engine: EngineId,
}

impl ReentrancyGuard {
    pub(crate) fn enter(engine: EngineId) -> Result<Self, RentalError> {
        Self::check(engine)?;
        SETTLING.with(|settling| settling.borrow_mut().push(engine));
        Ok(Self { engine })
    }

    pub(crate) fn check(engine: EngineId) -> Result<(), RentalError> {
        if SETTLING.with(|settling| settling.borrow().contains(&engine)) {
            return Err(RentalError::ReentrancyRisk);
        }
        Ok(())
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        SETTLING.with(|settling| {
            let mut settling = settling.borrow_mut();
            if let Some(index) = settling.iter().rposition(|engine| *engine == self.engine) {
                settling.remove(index);
            }
        });
    }
}

/// Runs every transfer or none of them. On the first rejection the legs that
/// already went out are reversed, newest first.
pub(crate) fn execute<P>(
    payout: &mut P,
    engine: EngineId,
    transfers: &[Transfer],
) -> Result<(), RentalError>
where
    P: Payout + ?Sized,
{
    let _guard = ReentrancyGuard::enter(engine)?;

    for (sent, transfer) in transfers.iter().enumerate() {
        debug!(
            "Paying {} to {} ({:?})",
            transfer.amount, transfer.to, transfer.leg
        );
        if let Err(rejected) = payout.transfer(&transfer.to, transfer.amount) {
            warn!(
                "{:?} of {} to {} rejected: {rejected}; reversing {sent} completed leg(s)",
                transfer.leg, transfer.amount, transfer.to
            );
            for completed in transfers[..sent].iter().rev() {
                payout.reverse(&completed.to, completed.amount);
            }
            return Err(RentalError::TransferFailed {
                leg: transfer.leg,
                amount: transfer.amount,
            });
        }
    }

    Ok(())
}
