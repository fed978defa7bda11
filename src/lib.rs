pub mod amount;
pub mod billing;
pub mod clock;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod registry;
pub mod replay;

use std::fmt::Display;

use amount::Amount;
use serde::{Deserialize, Serialize};

pub type ListingId = u64;
pub type Timestamp = u64;

// Identities are owned by the session layer; the engine only ever compares them.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rental {
    pub renter: Address,
    pub started_at: Timestamp,
    pub escrowed: Amount,
}

// Rental data only exists while rented, so "available iff no renter" can't be
// broken by a half-updated record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ListingState {
    #[default]
    Available,
    Rented(Rental),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub owner: Address,
    pub price_per_minute: Amount,
    pub deposit: Amount,
    pub state: ListingState,
}

impl Listing {
    pub fn is_available(&self) -> bool {
        matches!(self.state, ListingState::Available)
    }

    pub fn rental(&self) -> Option<&Rental> {
        match &self.state {
            ListingState::Available => None,
            ListingState::Rented(rental) => Some(rental),
        }
    }

    pub fn renter(&self) -> Option<&Address> {
        self.rental().map(|rental| &rental.renter)
    }
}

// Read model handed to observers. Escrow is deliberately not part of it.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Book {
    pub id: ListingId,
    pub title: String,
    pub owner: Address,
    pub price_per_minute: Amount,
    pub deposit: Amount,
    pub is_available: bool,
    pub renter: Option<Address>,
    pub rental_start_time: Option<Timestamp>,
}

impl From<&Listing> for Book {
    fn from(listing: &Listing) -> Self {
        let rental = listing.rental();
        Book {
            id: listing.id,
            title: listing.title.clone(),
            owner: listing.owner.clone(),
            price_per_minute: listing.price_per_minute,
            deposit: listing.deposit,
            is_available: listing.is_available(),
            renter: rental.map(|rental| rental.renter.clone()),
            rental_start_time: rental.map(|rental| rental.started_at),
        }
    }
}
