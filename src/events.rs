use crossbeam::channel::{Receiver, Sender};
use log::debug;
use serde::Serialize;

use crate::amount::Amount;
use crate::{Address, ListingId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    ItemListed {
        id: ListingId,
        owner: Address,
        title: String,
        price_per_minute: Amount,
        deposit: Amount,
    },
    ItemRented {
        id: ListingId,
        renter: Address,
    },
    ItemReturned {
        id: ListingId,
        renter: Address,
        refund_amount: Amount,
    },
    RefundSent {
        to: Address,
        amount: Amount,
    },
    PaymentSent {
        to: Address,
        amount: Amount,
    },
    DebugRefund {
        deposit: Amount,
        total_rent: Amount,
        refund_amount: Amount,
    },
}

// Events an operation wants to emit. Nothing reaches the log unless the whole
// operation succeeded; a dropped batch is simply discarded.
#[derive(Debug, Default)]
#[must_use]
pub struct EventBatch {
    events: Vec<Event>,
}

impl EventBatch {
    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
    subscribers: Vec<Sender<Event>>,
}

impl EventLog {
    /// Appends the batch in order, then forwards it to every live subscriber.
    /// Returns the offset of the first appended event.
    pub fn commit(&mut self, batch: EventBatch) -> usize {
        let offset = self.events.len();
        self.events.extend(batch.events);

        let published = &self.events[offset..];
        self.subscribers.retain(|subscriber| {
            published
                .iter()
                .all(|event| subscriber.send(event.clone()).is_ok())
        });

        debug!(
            "Committed {} event(s) at offset {offset}, {} subscriber(s)",
            published.len(),
            self.subscribers.len()
        );
        offset
    }

    /// Everything appended at or after `offset`. Past-the-end offsets yield
    /// nothing rather than an error so pollers can keep their last cursor.
    pub fn since(&self, offset: usize) -> &[Event] {
        self.events.get(offset..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (sender, receiver) = crossbeam::channel::unbounded();
        self.subscribers.push(sender);
        receiver
    }
}
