use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam::channel::Receiver;

use super::settlement::{EngineId, ReentrancyGuard};
use super::{Payout, RentalEngine, RentalError, RentalMarket};
use crate::amount::Amount;
use crate::clock::Clock;
use crate::events::Event;
use crate::{Address, Book, ListingId};

// Cloneable handle for concurrent callers. Writes hold the write lock for the
// whole operation, payouts included, so no reader ever sees a half-settled
// listing; reads share the lock with each other.
//
// Every entry point first checks the reentrancy guard. A payout that calls back
// into this engine on its own thread gets `ReentrancyRisk` instead of
// deadlocking on the lock it is running under.
#[derive(Debug)]
pub struct SharedRentalEngine<P, C> {
    id: EngineId,
    inner: Arc<RwLock<RentalEngine<P, C>>>,
}

impl<P, C> Clone for SharedRentalEngine<P, C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, C> SharedRentalEngine<P, C>
where
    P: Payout,
    C: Clock,
{
    pub fn new(engine: RentalEngine<P, C>) -> Self {
        Self {
            id: engine.id(),
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RentalEngine<P, C>>, RentalError> {
        ReentrancyGuard::check(self.id)?;
        self.inner.read().map_err(|_| RentalError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RentalEngine<P, C>>, RentalError> {
        ReentrancyGuard::check(self.id)?;
        self.inner.write().map_err(|_| RentalError::Poisoned)
    }

    pub fn list_item(
        &self,
        owner: &Address,
        title: &str,
        price_per_minute: Amount,
        deposit: Amount,
    ) -> Result<ListingId, RentalError> {
        self.write()?.list_item(owner, title, price_per_minute, deposit)
    }

    pub fn rent_item(
        &self,
        renter: &Address,
        id: ListingId,
        value: Amount,
    ) -> Result<(), RentalError> {
        self.write()?.rent_item(renter, id, value)
    }

    pub fn return_item(
        &self,
        caller: &Address,
        id: ListingId,
        extra_value: Amount,
    ) -> Result<(), RentalError> {
        self.write()?.return_item(caller, id, extra_value)
    }

    pub fn get_book(&self, id: ListingId) -> Result<Book, RentalError> {
        self.read()?.get_book(id)
    }

    pub fn get_book_count(&self) -> Result<u64, RentalError> {
        Ok(self.read()?.get_book_count())
    }

    pub fn quote_return(&self, id: ListingId) -> Result<Amount, RentalError> {
        self.read()?.quote_return(id)
    }

    pub fn events_since(&self, offset: usize) -> Result<Vec<Event>, RentalError> {
        Ok(self.read()?.events_since(offset).to_vec())
    }

    pub fn subscribe(&self) -> Result<Receiver<Event>, RentalError> {
        Ok(self.write()?.subscribe())
    }

    pub fn reserve(&self) -> Result<Amount, RentalError> {
        Ok(self.read()?.reserve())
    }

    /// Runs `inspect` against a consistent snapshot of the engine.
    pub fn inspect<R>(
        &self,
        inspect: impl FnOnce(&RentalEngine<P, C>) -> R,
    ) -> Result<R, RentalError> {
        Ok(inspect(&*self.read()?))
    }
}

impl<P, C> RentalMarket for SharedRentalEngine<P, C>
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
        SharedRentalEngine::list_item(self, owner, title, price_per_minute, deposit)
    }

    fn rent_item(
        &mut self,
        renter: &Address,
        id: ListingId,
        value: Amount,
    ) -> Result<(), RentalError> {
        SharedRentalEngine::rent_item(self, renter, id, value)
    }

    fn return_item(
        &mut self,
        renter: &Address,
        id: ListingId,
        extra_value: Amount,
    ) -> Result<(), RentalError> {
        SharedRentalEngine::return_item(self, renter, id, extra_value)
    }

    fn get_book(&self, id: ListingId) -> Result<Book, RentalError> {
        SharedRentalEngine::get_book(self, id)
    }

    fn get_book_count(&self) -> Result<u64, RentalError> {
        SharedRentalEngine::get_book_count(self)
    }
}
