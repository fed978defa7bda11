use crate::Timestamp;
use crate::amount::Amount;

pub const SECONDS_PER_MINUTE: u64 = 60;

// At least one minute is always charged, even for an immediate return.
pub const MINIMUM_BILLED_MINUTES: u64 = 1;

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("rent for {minutes} minute(s) at {price_per_minute} per minute overflows")]
    Overflow {
        price_per_minute: Amount,
        minutes: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    // deposit - total rent, goes back to the renter
    Refund(Amount),
    // total rent - deposit, must be paid on top of the deposit
    Shortfall(Amount),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bill {
    pub elapsed_minutes: u64,
    pub total_rent: Amount,
    pub settlement: Settlement,
}

impl Bill {
    pub fn settlement_amount(&self) -> Amount {
        match self.settlement {
            Settlement::Refund(amount) | Settlement::Shortfall(amount) => amount,
        }
    }

    pub fn is_shortfall(&self) -> bool {
        matches!(self.settlement, Settlement::Shortfall(_))
    }
}

pub fn elapsed_minutes(started_at: Timestamp, now: Timestamp) -> u64 {
    // A clock that went backwards counts as no time elapsed.
    let elapsed_seconds = now.saturating_sub(started_at);
    (elapsed_seconds / SECONDS_PER_MINUTE).max(MINIMUM_BILLED_MINUTES)
}

pub fn compute(
    price_per_minute: Amount,
    deposit: Amount,
    started_at: Timestamp,
    now: Timestamp,
) -> Result<Bill, BillingError> {
    let minutes = elapsed_minutes(started_at, now);
    let total_rent = price_per_minute
        .checked_mul(minutes)
        .ok_or(BillingError::Overflow {
            price_per_minute,
            minutes,
        })?;

    // Exactly one of the two subtractions succeeds (both when equal, which is a
    // zero refund).
    let settlement = match deposit.checked_sub(total_rent) {
        Some(refund) => Settlement::Refund(refund),
        None => Settlement::Shortfall(total_rent.checked_sub(deposit).unwrap_or(Amount::ZERO)),
    };

    Ok(Bill {
        elapsed_minutes: minutes,
        total_rent,
        settlement,
    })
}

/// Extra value a renter has to attach to a return made at `now`.
pub fn quote(
    price_per_minute: Amount,
    deposit: Amount,
    started_at: Timestamp,
    now: Timestamp,
) -> Result<Amount, BillingError> {
    let bill = compute(price_per_minute, deposit, started_at, now)?;
    Ok(match bill.settlement {
        Settlement::Refund(_) => Amount::ZERO,
        Settlement::Shortfall(shortfall) => shortfall,
    })
}
