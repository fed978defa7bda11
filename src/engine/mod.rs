pub mod settlement;
pub mod shared;

pub use settlement::{EngineId, Leg, Payout, TransferRejected};
pub use shared::SharedRentalEngine;

use log::{debug, info};

use crate::amount::Amount;
use crate::billing::{self, BillingError, Settlement};
use crate::clock::{Clock, SystemClock};
use crate::events::{Event, EventBatch, EventLog};
use crate::registry::Registry;
use crate::{Address, Book, ListingId, ListingState, Rental};

use settlement::ReentrancyGuard;

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum RentalError {
    #[error("price per minute must be greater than zero")]
    InvalidPrice,
    #[error("listing {0} does not exist")]
    NotFound(ListingId),
    #[error("listing {0} is already rented")]
    NotAvailable(ListingId),
    #[error("owner can not rent listing {0}")]
    SelfRental(ListingId),
    #[error("insufficient payment: required {required}, provided {provided}")]
    InsufficientPayment { required: Amount, provided: Amount },
    #[error("listing {0} is not rented")]
    NotRented(ListingId),
    #[error("caller is not the renter of listing {0}")]
    NotRenter(ListingId),
    #[error("arithmetic overflow")]
    ArithmeticOverflow,
    #[error("unexpected payment of {0}, nothing is owed")]
    InvalidPayment(Amount),
    #[error("{leg:?} transfer of {amount} failed")]
    TransferFailed { leg: Leg, amount: Amount },
    #[error("engine re-entered during settlement")]
    ReentrancyRisk,
    #[error("engine lock poisoned")]
    Poisoned,
}

impl From<BillingError> for RentalError {
    fn from(_: BillingError) -> Self {
        RentalError::ArithmeticOverflow
    }
}

// The operations observers and the session layer drive. Implemented by the
// single-owner engine and by the shared, lock-protected handle.
pub trait RentalMarket {
    fn list_item(
        &mut self,
        owner: &Address,
        title: &str,
        price_per_minute: Amount,
        deposit: Amount,
    ) -> Result<ListingId, RentalError>;
    fn rent_item(&mut self, renter: &Address, id: ListingId, value: Amount)
    -> Result<(), RentalError>;
    fn return_item(
        &mut self,
        renter: &Address,
        id: ListingId,
        extra_value: Amount,
    ) -> Result<(), RentalError>;
    fn get_book(&self, id: ListingId) -> Result<Book, RentalError>;
    fn get_book_count(&self) -> Result<u64, RentalError>;
}

// Owns every listing, the event log and the outbound payout channel. All
// mutation goes through `&mut self`, so operations are serialized by
// construction; see `SharedRentalEngine` for concurrent use.
#[derive(Debug)]
pub struct RentalEngine<P, C = SystemClock> {
    id: EngineId,
    registry: Registry,
    events: EventLog,
    payout: P,
    clock: C,
    // Escrow above the deposit (the first-minute prepayment and any
    // overpayment at rent time) is kept here on return.
    reserve: Amount,
}

impl<P> RentalEngine<P>
where
    P: Payout,
{
    pub fn with_system_clock(payout: P) -> Self {
        Self::new(payout, SystemClock)
    }
}

impl<P, C> RentalEngine<P, C>
where
    P: Payout,
    C: Clock,
{
    pub fn new(payout: P, clock: C) -> Self {
        Self {
            id: EngineId::next(),
            registry: Registry::default(),
            events: EventLog::default(),
            payout,
            clock,
            reserve: Amount::ZERO,
        }
    }

    pub(crate) fn id(&self) -> EngineId {
        self.id
    }

    pub fn list_item(
        &mut self,
        owner: &Address,
        title: &str,
        price_per_minute: Amount,
        deposit: Amount,
    ) -> Result<ListingId, RentalError> {
        ReentrancyGuard::check(self.id)?;
        debug!("[{owner}] Listing {title:?} at {price_per_minute}/min, deposit {deposit}");

        let id = self
            .registry
            .create(owner.clone(), title.to_owned(), price_per_minute, deposit)?;

        let mut batch = EventBatch::default();
        batch.push(Event::ItemListed {
            id,
            owner: owner.clone(),
            title: title.to_owned(),
            price_per_minute,
            deposit,
        });
        self.events.commit(batch);

        info!("[Listing {id}] Listed by {owner}");
        Ok(id)
    }

    pub fn rent_item(
        &mut self,
        renter: &Address,
        id: ListingId,
        value: Amount,
    ) -> Result<(), RentalError> {
        ReentrancyGuard::check(self.id)?;
        debug!("[Listing {id}] {renter} renting with {value}");

        let now = self.clock.now();
        let listing = self.registry.get_mut(id)?;
        if !listing.is_available() {
            return Err(RentalError::NotAvailable(id));
        }
        if listing.owner == *renter {
            return Err(RentalError::SelfRental(id));
        }

        // Deposit plus the first minute up front.
        let required = listing
            .deposit
            .checked_add(listing.price_per_minute)
            .ok_or(RentalError::ArithmeticOverflow)?;
        if value < required {
            return Err(RentalError::InsufficientPayment {
                required,
                provided: value,
            });
        }

        listing.state = ListingState::Rented(Rental {
            renter: renter.clone(),
            started_at: now,
            escrowed: value,
        });

        let mut batch = EventBatch::default();
        batch.push(Event::ItemRented {
            id,
            renter: renter.clone(),
        });
        self.events.commit(batch);

        info!("[Listing {id}] Rented by {renter} at {now}, escrowed {value}");
        Ok(())
    }

    pub fn return_item(
        &mut self,
        caller: &Address,
        id: ListingId,
        extra_value: Amount,
    ) -> Result<(), RentalError> {
        ReentrancyGuard::check(self.id)?;
        debug!("[Listing {id}] {caller} returning with extra {extra_value}");

        let now = self.clock.now();
        let listing = self.registry.get_mut(id)?;
        let rental = match &listing.state {
            ListingState::Available => return Err(RentalError::NotRented(id)),
            ListingState::Rented(rental) => rental,
        };
        if rental.renter != *caller {
            return Err(RentalError::NotRenter(id));
        }

        // Checks: everything that can fail without side effects happens first.
        let bill = billing::compute(
            listing.price_per_minute,
            listing.deposit,
            rental.started_at,
            now,
        )?;
        let refund = match bill.settlement {
            Settlement::Refund(refund) => {
                if !extra_value.is_zero() {
                    return Err(RentalError::InvalidPayment(extra_value));
                }
                refund
            }
            Settlement::Shortfall(shortfall) => extra_value
                .checked_sub(shortfall)
                .ok_or(RentalError::InsufficientPayment {
                    required: shortfall,
                    provided: extra_value,
                })?,
        };
        let retained = rental
            .escrowed
            .checked_sub(listing.deposit)
            .ok_or(RentalError::ArithmeticOverflow)?;
        let reserve = self
            .reserve
            .checked_add(retained)
            .ok_or(RentalError::ArithmeticOverflow)?;

        // Effects: the listing is available again before any value leaves.
        let renter = caller.clone();
        let deposit = listing.deposit;
        let owner = listing.owner.clone();
        let previous = std::mem::take(&mut listing.state);

        // Interactions.
        let transfers = settlement::plan(&renter, refund, &owner, bill.total_rent);
        if let Err(err) = settlement::execute(&mut self.payout, self.id, &transfers) {
            listing.state = previous;
            return Err(err);
        }
        self.reserve = reserve;

        let mut batch = EventBatch::default();
        batch.push(Event::DebugRefund {
            deposit,
            total_rent: bill.total_rent,
            refund_amount: refund,
        });
        if !refund.is_zero() {
            batch.push(Event::RefundSent {
                to: renter.clone(),
                amount: refund,
            });
        }
        batch.push(Event::PaymentSent {
            to: owner,
            amount: bill.total_rent,
        });
        batch.push(Event::ItemReturned {
            id,
            renter: renter.clone(),
            refund_amount: refund,
        });
        self.events.commit(batch);

        info!(
            "[Listing {id}] Returned by {renter} after {} minute(s): rent {}, refund {refund}",
            bill.elapsed_minutes, bill.total_rent
        );
        Ok(())
    }

    /// Extra value the current renter would have to attach to return now.
    pub fn quote_return(&self, id: ListingId) -> Result<Amount, RentalError> {
        let listing = self.registry.get(id)?;
        let rental = listing.rental().ok_or(RentalError::NotRented(id))?;
        Ok(billing::quote(
            listing.price_per_minute,
            listing.deposit,
            rental.started_at,
            self.clock.now(),
        )?)
    }

    pub fn get_book(&self, id: ListingId) -> Result<Book, RentalError> {
        self.registry.get(id).map(Book::from)
    }

    pub fn get_book_count(&self) -> u64 {
        self.registry.count()
    }

    pub fn books(&self) -> Vec<Book> {
        self.registry.iter().map(Book::from).collect()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events_since(&self, offset: usize) -> &[Event] {
        self.events.since(offset)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn subscribe(&mut self) -> crossbeam::channel::Receiver<Event> {
        self.events.subscribe()
    }

    /// Escrow kept by the engine on return: the first-minute prepayment and any
    /// overpayment at rent time. It is held, not owed to anyone, and no
    /// operation pays it out.
    pub fn reserve(&self) -> Amount {
        self.reserve
    }

    pub fn payout(&self) -> &P {
        &self.payout
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<P, C> RentalMarket for RentalEngine<P, C>
where
    P: Payout,
    C: Clock,
{
    fn list_item(
        &mut self,
        owner: &Address,
        title: &str,
        price_per_minute: Amount,
        deposit: Amount,
    ) -> Result<ListingId, RentalError> {
        RentalEngine::list_item(self, owner, title, price_per_minute, deposit)
    }

    fn rent_item(
        &mut self,
        renter: &Address,
        id: ListingId,
        value: Amount,
    ) -> Result<(), RentalError> {
        RentalEngine::rent_item(self, renter, id, value)
    }

    fn return_item(
        &mut self,
        renter: &Address,
        id: ListingId,
        extra_value: Amount,
    ) -> Result<(), RentalError> {
        RentalEngine::return_item(self, renter, id, extra_value)
    }

    fn get_book(&self, id: ListingId) -> Result<Book, RentalError> {
        RentalEngine::get_book(self, id)
    }

    fn get_book_count(&self) -> Result<u64, RentalError> {
        Ok(RentalEngine::get_book_count(self))
    }
}

#[cfg(test)]
mod engine_tests {
    use googletest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::InMemoryLedger;

    type TestEngine = RentalEngine<InMemoryLedger, ManualClock>;

    const START: u64 = 1_700_000_000;

    fn eth(raw: &str) -> Amount {
        raw.parse().unwrap()
    }

    fn owner() -> Address {
        Address::from("0xowner")
    }

    fn renter() -> Address {
        Address::from("0xrenter")
    }

    fn engine() -> TestEngine {
        RentalEngine::new(InMemoryLedger::default(), ManualClock::new(START))
    }

    // Lists one book and rents it with deposit + first minute.
    fn rented_engine(price: &str, deposit: &str) -> TestEngine {
        let mut engine = engine();
        let id = engine
            .list_item(&owner(), "Test Book", eth(price), eth(deposit))
            .unwrap();
        let value = eth(deposit).checked_add(eth(price)).unwrap();
        engine.rent_item(&renter(), id, value).unwrap();
        engine
    }

    #[gtest]
    pub fn listing_emits_item_listed() {
        let mut engine = engine();

        expect_that!(
            engine.list_item(&owner(), "Dune", eth("0.01"), eth("1")),
            ok(eq(0))
        );
        assert_eq!(
            engine.events_since(0),
            &[Event::ItemListed {
                id: 0,
                owner: owner(),
                title: "Dune".to_owned(),
                price_per_minute: eth("0.01"),
                deposit: eth("1"),
            }]
        );
    }

    #[gtest]
    pub fn zero_price_is_rejected_without_events() {
        let mut engine = engine();

        expect_that!(
            engine.list_item(&owner(), "Free", Amount::ZERO, eth("1")),
            err(eq(RentalError::InvalidPrice))
        );
        expect_that!(engine.event_count(), eq(0));
        expect_that!(engine.get_book_count(), eq(0));
    }

    #[gtest]
    pub fn rent_requires_deposit_plus_first_minute() {
        let mut engine = engine();
        engine
            .list_item(&owner(), "Dune", eth("0.05"), eth("0.5"))
            .unwrap();

        expect_that!(
            engine.rent_item(&renter(), 0, eth("0.549")),
            err(eq(RentalError::InsufficientPayment {
                required: eth("0.55"),
                provided: eth("0.549"),
            }))
        );
        expect_that!(engine.rent_item(&renter(), 0, eth("0.55")), ok(eq(())));
    }

    #[gtest]
    pub fn rent_sets_renter_start_and_escrow() {
        let engine = rented_engine("0.05", "0.5");

        assert_eq!(
            engine.registry().get(0).unwrap().state,
            ListingState::Rented(Rental {
                renter: renter(),
                started_at: START,
                escrowed: eth("0.55"),
            })
        );
        let book = engine.get_book(0).unwrap();
        expect_that!(book.is_available, is_false());
        expect_that!(book.rental_start_time, some(eq(START)));
        assert_eq!(book.renter, Some(renter()));
    }

    #[gtest]
    pub fn owner_can_not_rent_own_listing() {
        let mut engine = engine();
        engine
            .list_item(&owner(), "Dune", eth("0.05"), eth("0.5"))
            .unwrap();

        expect_that!(
            engine.rent_item(&owner(), 0, eth("10")),
            err(eq(RentalError::SelfRental(0)))
        );
        expect_that!(engine.get_book(0).unwrap().is_available, is_true());
        expect_that!(engine.event_count(), eq(1));
    }

    #[gtest]
    pub fn can_not_rent_twice() {
        let mut engine = rented_engine("0.05", "0.5");

        expect_that!(
            engine.rent_item(&Address::from("0xother"), 0, eth("10")),
            err(eq(RentalError::NotAvailable(0)))
        );
    }

    #[gtest]
    pub fn unknown_listing_is_not_found() {
        let mut engine = engine();

        expect_that!(
            engine.rent_item(&renter(), 3, eth("1")),
            err(eq(RentalError::NotFound(3)))
        );
        expect_that!(
            engine.return_item(&renter(), 3, Amount::ZERO),
            err(eq(RentalError::NotFound(3)))
        );
        expect_that!(engine.get_book(3).map(|_| ()), err(eq(RentalError::NotFound(3))));
    }

    #[gtest]
    pub fn can_not_return_available_listing() {
        let mut engine = engine();
        engine
            .list_item(&owner(), "Dune", eth("0.05"), eth("0.5"))
            .unwrap();

        expect_that!(
            engine.return_item(&renter(), 0, Amount::ZERO),
            err(eq(RentalError::NotRented(0)))
        );
    }

    #[gtest]
    pub fn non_renter_can_not_return() {
        let mut engine = rented_engine("0.05", "0.5");
        let events_before = engine.event_count();
        engine.clock().advance(5 * 60);

        expect_that!(
            engine.return_item(&Address::from("0xstranger"), 0, Amount::ZERO),
            err(eq(RentalError::NotRenter(0)))
        );
        expect_that!(engine.get_book(0).unwrap().is_available, is_false());
        expect_that!(engine.event_count(), eq(events_before));
    }

    #[gtest]
    pub fn return_within_deposit_refunds_the_rest() {
        let mut engine = rented_engine("0.05", "0.5");
        let offset = engine.event_count();
        engine.clock().advance(5 * 60);

        expect_that!(engine.return_item(&renter(), 0, Amount::ZERO), ok(eq(())));

        assert_eq!(
            engine.events_since(offset),
            &[
                Event::DebugRefund {
                    deposit: eth("0.5"),
                    total_rent: eth("0.25"),
                    refund_amount: eth("0.25"),
                },
                Event::RefundSent {
                    to: renter(),
                    amount: eth("0.25"),
                },
                Event::PaymentSent {
                    to: owner(),
                    amount: eth("0.25"),
                },
                Event::ItemReturned {
                    id: 0,
                    renter: renter(),
                    refund_amount: eth("0.25"),
                },
            ]
        );
        expect_that!(engine.payout().balance(&owner()), eq(eth("0.25")));
        expect_that!(engine.payout().balance(&renter()), eq(eth("0.25")));
        expect_that!(engine.reserve(), eq(eth("0.05")));
    }

    #[gtest]
    pub fn immediate_return_bills_one_minute() {
        let mut engine = rented_engine("0.05", "0.5");

        expect_that!(engine.return_item(&renter(), 0, Amount::ZERO), ok(eq(())));
        expect_that!(engine.payout().balance(&owner()), eq(eth("0.05")));
        expect_that!(engine.payout().balance(&renter()), eq(eth("0.45")));
    }

    #[gtest]
    pub fn extra_value_is_rejected_when_nothing_is_owed() {
        let mut engine = rented_engine("0.05", "0.5");
        engine.clock().advance(5 * 60);

        expect_that!(
            engine.return_item(&renter(), 0, eth("0.01")),
            err(eq(RentalError::InvalidPayment(eth("0.01"))))
        );
        expect_that!(engine.get_book(0).unwrap().is_available, is_false());
        expect_that!(engine.payout().balance(&owner()), eq(Amount::ZERO));
    }

    #[gtest]
    pub fn shortfall_requires_extra_payment() {
        let mut engine = rented_engine("0.1", "0.5");
        engine.clock().advance(10 * 60);

        expect_that!(engine.quote_return(0), ok(eq(eth("0.5"))));
        expect_that!(
            engine.return_item(&renter(), 0, eth("0.4")),
            err(eq(RentalError::InsufficientPayment {
                required: eth("0.5"),
                provided: eth("0.4"),
            }))
        );
        expect_that!(engine.get_book(0).unwrap().is_available, is_false());
    }

    #[gtest]
    pub fn exact_shortfall_settles_without_refund() {
        let mut engine = rented_engine("0.1", "0.5");
        let offset = engine.event_count();
        engine.clock().advance(10 * 60);

        expect_that!(engine.return_item(&renter(), 0, eth("0.5")), ok(eq(())));

        assert_eq!(
            engine.events_since(offset),
            &[
                Event::DebugRefund {
                    deposit: eth("0.5"),
                    total_rent: eth("1"),
                    refund_amount: Amount::ZERO,
                },
                Event::PaymentSent {
                    to: owner(),
                    amount: eth("1"),
                },
                Event::ItemReturned {
                    id: 0,
                    renter: renter(),
                    refund_amount: Amount::ZERO,
                },
            ]
        );
        expect_that!(engine.payout().balance(&owner()), eq(eth("1")));
        expect_that!(engine.payout().balance(&renter()), eq(Amount::ZERO));
    }

    #[gtest]
    pub fn overpaid_shortfall_refunds_the_excess() {
        let mut engine = rented_engine("0.1", "0.5");
        engine.clock().advance(10 * 60);

        expect_that!(engine.return_item(&renter(), 0, eth("0.8")), ok(eq(())));
        expect_that!(engine.payout().balance(&owner()), eq(eth("1")));
        expect_that!(engine.payout().balance(&renter()), eq(eth("0.3")));
    }

    #[gtest]
    pub fn overflowing_rent_aborts_return() {
        let mut engine = engine();
        let huge = Amount::MAX.checked_sub(Amount::from(1)).unwrap();
        engine
            .list_item(&owner(), "Priceless", huge, Amount::ZERO)
            .unwrap();
        engine.rent_item(&renter(), 0, huge).unwrap();
        engine.clock().advance(2 * 60);

        expect_that!(
            engine.return_item(&renter(), 0, Amount::ZERO),
            err(eq(RentalError::ArithmeticOverflow))
        );
        expect_that!(engine.get_book(0).unwrap().is_available, is_false());
    }

    #[gtest]
    pub fn overflowing_rent_requirement_aborts_rent() {
        let mut engine = engine();
        engine
            .list_item(&owner(), "Priceless", Amount::MAX, Amount::from(1))
            .unwrap();

        expect_that!(
            engine.rent_item(&renter(), 0, Amount::MAX),
            err(eq(RentalError::ArithmeticOverflow))
        );
    }

    #[gtest]
    pub fn failed_transfer_rolls_back_everything() {
        let mut engine = rented_engine("0.05", "0.5");
        let offset = engine.event_count();
        engine.payout.refuse(&owner());
        engine.clock().advance(5 * 60);

        expect_that!(
            engine.return_item(&renter(), 0, Amount::ZERO),
            err(eq(RentalError::TransferFailed {
                leg: Leg::OwnerPayment,
                amount: eth("0.25"),
            }))
        );
        // The refund leg went out first and was reversed.
        expect_that!(engine.payout().balance(&renter()), eq(Amount::ZERO));
        expect_that!(engine.reserve(), eq(Amount::ZERO));
        expect_that!(engine.event_count(), eq(offset));
        assert_eq!(
            engine.registry().get(0).unwrap().state,
            ListingState::Rented(Rental {
                renter: renter(),
                started_at: START,
                escrowed: eth("0.55"),
            })
        );

        engine.payout.accept(&owner());
        expect_that!(engine.return_item(&renter(), 0, Amount::ZERO), ok(eq(())));
    }

    #[gtest]
    pub fn failed_refund_transfer_rolls_back() {
        let mut engine = rented_engine("0.05", "0.5");
        let offset = engine.event_count();
        engine.payout.refuse(&renter());
        engine.clock().advance(5 * 60);

        expect_that!(
            engine.return_item(&renter(), 0, Amount::ZERO),
            err(eq(RentalError::TransferFailed {
                leg: Leg::Refund,
                amount: eth("0.25"),
            }))
        );
        // The refund is the first leg, so the owner was never paid.
        expect_that!(engine.payout().balance(&owner()), eq(Amount::ZERO));
        expect_that!(engine.payout().balance(&renter()), eq(Amount::ZERO));
        expect_that!(engine.reserve(), eq(Amount::ZERO));
        expect_that!(engine.event_count(), eq(offset));
        expect_that!(engine.get_book(0).unwrap().is_available, is_false());
        assert_eq!(engine.get_book(0).unwrap().renter, Some(renter()));
    }

    #[gtest]
    pub fn system_clock_engine_stamps_rentals_with_wall_time() {
        let mut engine = RentalEngine::with_system_clock(InMemoryLedger::default());
        engine
            .list_item(&owner(), "Dune", eth("0.05"), eth("0.5"))
            .unwrap();
        engine.rent_item(&renter(), 0, eth("0.55")).unwrap();

        expect_that!(
            engine.get_book(0).unwrap().rental_start_time,
            some(ge(START))
        );
        expect_that!(engine.quote_return(0), ok(eq(Amount::ZERO)));
    }

    #[gtest]
    pub fn returned_listing_can_be_rented_again() {
        let mut engine = rented_engine("0.05", "0.5");
        engine.clock().advance(3 * 60);
        engine.return_item(&renter(), 0, Amount::ZERO).unwrap();

        let book = engine.get_book(0).unwrap();
        expect_that!(book.is_available, is_true());
        expect_that!(book.rental_start_time, none());
        assert_eq!(book.renter, None);

        let second = Address::from("0xsecond");
        expect_that!(engine.rent_item(&second, 0, eth("0.55")), ok(eq(())));
        assert_eq!(engine.get_book(0).unwrap().renter, Some(second));
    }

    #[gtest]
    pub fn subscribers_receive_committed_events_in_order() {
        let mut engine = engine();
        let receiver = engine.subscribe();
        engine
            .list_item(&owner(), "Dune", eth("0.05"), eth("0.5"))
            .unwrap();
        engine.rent_item(&owner(), 0, eth("1")).unwrap_err();
        engine.rent_item(&renter(), 0, eth("0.55")).unwrap();

        let received = receiver.try_iter().collect::<Vec<_>>();
        assert_eq!(received.as_slice(), engine.events_since(0));
        expect_that!(received.len(), eq(2));
    }
}
