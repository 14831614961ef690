//! Registry of live subscribers.

use crate::error::{BrokerError, Result};
use crate::types::Entry;
use crossbeam_channel::{bounded, Select, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::types::{CloseReason, CloseSlot, CloseState, Subscription, SubscriptionId};

/// Outcome of offering one entry to a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Offer {
    Delivered,
    /// Buffer full, or the send timed out.
    Full,
    /// Already closed or its receiver is gone.
    Gone,
}

/// Registry-side half of a subscription.
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    sender: Sender<Entry>,
    status: CloseSlot,
}

impl Subscriber {
    /// Offer an entry without blocking, or waiting at most `send_timeout`.
    ///
    /// Every send attempt runs under the close lock, so once the subscriber
    /// has been closed nothing more reaches its channel.
    pub(crate) fn offer(&self, entry: &Entry, send_timeout: Option<Duration>) -> Offer {
        let deadline = send_timeout.map(|t| Instant::now() + t);
        loop {
            let attempt = self
                .status
                .while_open(|| self.sender.try_send(entry.clone()));
            match attempt {
                None => return Offer::Gone,
                Some(Ok(())) => return Offer::Delivered,
                Some(Err(TrySendError::Disconnected(_))) => return Offer::Gone,
                Some(Err(TrySendError::Full(_))) => {}
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => return Offer::Full,
            };
            if remaining.is_zero() {
                return Offer::Full;
            }

            // Park until there is room or the subscriber closes, then retry.
            let mut select = Select::new();
            select.send(&self.sender);
            select.recv(self.status.closed());
            if select.ready_timeout(remaining).is_err() {
                return Offer::Full;
            }
        }
    }

    fn mark(&self, reason: CloseReason) {
        self.status.mark(reason);
    }
}

struct State {
    subscribers: HashMap<SubscriptionId, Subscriber>,
    /// Cleared once the registry is drained for good.
    open: bool,
}

/// Concurrency-safe table of active subscriptions.
///
/// One lock guards the table. Fan-out takes a [`snapshot`](Self::snapshot)
/// under the lock and sends outside it, so a slow subscriber never blocks
/// registration or removal.
pub struct SubscriberRegistry {
    state: Mutex<State>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                subscribers: HashMap::new(),
                open: true,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber whose channel buffers up to `buffer_size`
    /// entries (0 makes every send a rendezvous).
    pub fn register(self: &Arc<Self>, buffer_size: usize) -> Result<Subscription> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(buffer_size);
        let status: CloseSlot = Arc::new(CloseState::new());

        {
            let mut state = self.state.lock();
            if !state.open {
                return Err(BrokerError::AlreadyStopped);
            }
            state.subscribers.insert(
                id,
                Subscriber {
                    id,
                    sender,
                    status: Arc::clone(&status),
                },
            );
        }

        debug!(subscription = %id, buffer_size, "subscriber registered");

        Ok(Subscription {
            id,
            receiver,
            status,
            registry: Arc::clone(self),
        })
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        self.close(id, CloseReason::Unsubscribed)
    }

    /// Remove a subscriber and close its channel with `reason`.
    pub fn close(&self, id: SubscriptionId, reason: CloseReason) -> bool {
        let removed = self.state.lock().subscribers.remove(&id);
        match removed {
            Some(subscriber) => {
                match reason {
                    CloseReason::Unsubscribed => debug!(subscription = %id, "subscriber removed"),
                    ref other => info!(subscription = %id, reason = %other, "subscriber closed"),
                }
                subscriber.mark(reason);
                true
            }
            None => false,
        }
    }

    /// Close every subscriber with `reason` and refuse new registrations.
    /// Returns how many were closed.
    pub fn drain(&self, reason: CloseReason) -> usize {
        let drained: Vec<Subscriber> = {
            let mut state = self.state.lock();
            state.open = false;
            state.subscribers.drain().map(|(_, s)| s).collect()
        };
        for subscriber in &drained {
            subscriber.mark(reason.clone());
        }
        if !drained.is_empty() {
            info!(count = drained.len(), reason = %reason, "closed all subscribers");
        }
        drained.len()
    }

    /// Current subscribers, in no particular order.
    pub(crate) fn snapshot(&self) -> Vec<Subscriber> {
        self.state.lock().subscribers.values().cloned().collect()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.state.lock().subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether new subscribers are still accepted.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
