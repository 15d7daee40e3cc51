//! Payment event fan-out
//!
//! Each subscriber owns a bounded channel. Publishing never waits: a subscriber
//! whose buffer is full, or whose receiver is gone, is dropped from the bus.

use crate::types::{AccountId, Coins, OpCode, RecordId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// How an intent ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Completed,
    Failed,
}

/// Published after a value-moving operation commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentEvent {
    pub record_id: RecordId,
    pub op: OpCode,
    pub debit: AccountId,
    pub credit: AccountId,
    pub amount: Coins,
    pub outcome: EventOutcome,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::Sender<PaymentEvent>,
}

/// Non-blocking publisher to any number of bounded subscribers.
#[derive(Debug)]
pub struct EventBus {
    buffer: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: Mutex<u64>,
}

impl EventBus {
    /// # Arguments
    ///
    /// * `buffer` - capacity of each subscriber's channel
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Register a subscriber. It is dropped as soon as it falls `buffer` events
    /// behind.
    pub fn subscribe(&self) -> mpsc::Receiver<PaymentEvent> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.subscribers.lock().push(Subscriber { id, sender });
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every subscriber that has room for it.
    pub fn publish(&self, event: PaymentEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = subscriber.id, "dropping slow event subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = subscriber.id, "event subscriber went away");
                false
            }
        });
    }
}
