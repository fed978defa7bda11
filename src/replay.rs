use log::debug;
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::clock::ManualClock;
use crate::engine::{RentalError, RentalMarket};
use crate::{Address, ListingId, Timestamp};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Rent,
    Return,
}

// One row of a replay file:
//
//   op,at,caller,id,title,price,deposit,value
//   list,0,0xowner,,Dune,0.05,0.5,
//   rent,60,0xrenter,0,,,,0.55
//   return,360,0xrenter,0,,,,
//
// Which columns are required depends on `op`; csv + serde can't express that
// per variant without a hand-written deserializer, so they are all optional here
// and checked in `apply`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Command {
    pub op: Operation,
    pub at: Timestamp,
    pub caller: Address,
    pub id: Option<ListingId>,
    pub title: Option<String>,
    pub price: Option<Amount>,
    pub deposit: Option<Amount>,
    pub value: Option<Amount>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("{op:?} at {at} is missing `{field}`")]
    MissingField {
        op: Operation,
        at: Timestamp,
        field: &'static str,
    },
    #[error(transparent)]
    Rental(#[from] RentalError),
}

fn required<T>(
    command: &Command,
    field: &'static str,
    value: Option<T>,
) -> Result<T, ReplayError> {
    value.ok_or(ReplayError::MissingField {
        op: command.op,
        at: command.at,
        field,
    })
}

/// Moves `clock` to the command's time and runs it against `market`.
pub fn apply<M>(
    market: &mut M,
    clock: &ManualClock,
    command: &Command,
) -> Result<(), ReplayError>
where
    M: RentalMarket,
{
    debug!(
        "[{}] Replaying {:?} at {}",
        command.caller, command.op, command.at
    );
    clock.set(command.at);

    match command.op {
        Operation::List => {
            let title = required(command, "title", command.title.as_deref())?;
            let price = required(command, "price", command.price)?;
            // A listing without a deposit column is a zero-deposit listing.
            let deposit = command.deposit.unwrap_or_default();
            market.list_item(&command.caller, title, price, deposit)?;
        }
        Operation::Rent => {
            let id = required(command, "id", command.id)?;
            let value = required(command, "value", command.value)?;
            market.rent_item(&command.caller, id, value)?;
        }
        Operation::Return => {
            let id = required(command, "id", command.id)?;
            let extra = command.value.unwrap_or_default();
            market.return_item(&command.caller, id, extra)?;
        }
    }
    Ok(())
}
