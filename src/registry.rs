use crate::amount::Amount;
use crate::engine::RentalError;
use crate::{Address, Listing, ListingId, ListingState};

// Append-only. Ids are vector indices, so they start at 0, are handed out in
// order and can never be reused.
#[derive(Debug, Default)]
pub struct Registry {
    listings: Vec<Listing>,
}

impl Registry {
    pub fn create(
        &mut self,
        owner: Address,
        title: String,
        price_per_minute: Amount,
        deposit: Amount,
    ) -> Result<ListingId, RentalError> {
        if price_per_minute.is_zero() {
            return Err(RentalError::InvalidPrice);
        }

        let id = self.count();
        self.listings.push(Listing {
            id,
            title,
            owner,
            price_per_minute,
            deposit,
            state: ListingState::Available,
        });
        Ok(id)
    }

    pub fn get(&self, id: ListingId) -> Result<&Listing, RentalError> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.listings.get(index))
            .ok_or(RentalError::NotFound(id))
    }

    pub(crate) fn get_mut(&mut self, id: ListingId) -> Result<&mut Listing, RentalError> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.listings.get_mut(index))
            .ok_or(RentalError::NotFound(id))
    }

    pub fn count(&self) -> u64 {
        self.listings.len() as u64
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listing> {
        self.listings.iter()
    }
}
